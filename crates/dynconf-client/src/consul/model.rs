//! Consul KV wire models

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::watcher::value_text;

/// Header carrying the blocking-query index
pub const CONSUL_INDEX_HEADER: &str = "X-Consul-Index";
/// Header carrying the ACL token
pub const CONSUL_TOKEN_HEADER: &str = "X-Consul-Token";

/// Entry of a `/v1/kv/{key}` response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KVPair {
    #[serde(rename = "Key")]
    pub key: String,

    #[serde(rename = "CreateIndex", default)]
    pub create_index: u64,

    #[serde(rename = "ModifyIndex", default)]
    pub modify_index: u64,

    #[serde(rename = "LockIndex", default)]
    pub lock_index: u64,

    #[serde(rename = "Flags", default)]
    pub flags: u64,

    /// Base64 encoded; `null` for a key stored without a value
    #[serde(rename = "Value", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(rename = "Session", default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl KVPair {
    /// Decoded value text. A key without a value reads as the empty string.
    pub fn decoded_value(&self) -> Result<String> {
        let Some(value) = &self.value else {
            return Ok(String::new());
        };
        let raw = BASE64.decode(value).map_err(|e| ClientError::InvalidValue {
            key: self.key.clone(),
            reason: e.to_string(),
        })?;
        value_text(&self.key, raw)
    }
}
