//! etcd v3 JSON gateway models
//!
//! Keys and values travel base64 encoded; 64-bit integers are encoded as
//! JSON strings.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ClientError;
use crate::watcher::value_text;

/// Accepts a 64-bit integer encoded either as a JSON number or a string
pub(crate) mod int64 {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(i64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeRequest {
    pub key: String,
}

impl RangeRequest {
    pub fn new(key: &str) -> Self {
        Self {
            key: BASE64.encode(key.as_bytes()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseHeader {
    #[serde(default, deserialize_with = "int64::deserialize")]
    pub revision: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyValue {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, deserialize_with = "int64::deserialize")]
    pub mod_revision: i64,
}

impl KeyValue {
    /// Decoded key, for diagnostics
    pub fn decoded_key(&self) -> String {
        BASE64
            .decode(&self.key)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_else(|_| self.key.clone())
    }

    /// Decoded value text
    pub fn decoded_value(&self) -> crate::error::Result<String> {
        let raw = BASE64
            .decode(&self.value)
            .map_err(|e| ClientError::InvalidValue {
                key: self.decoded_key(),
                reason: e.to_string(),
            })?;
        value_text(&self.decoded_key(), raw)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RangeResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default)]
    pub kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchCreateRequest {
    pub key: String,
    pub start_revision: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchRequest {
    pub create_request: WatchCreateRequest,
}

impl WatchRequest {
    pub fn create(key: &str, start_revision: i64) -> Self {
        Self {
            create_request: WatchCreateRequest {
                key: BASE64.encode(key.as_bytes()),
                start_revision,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    #[default]
    Put,
    Delete,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Event {
    #[serde(default, rename = "type")]
    pub kind: EventType,
    #[serde(default)]
    pub kv: KeyValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default)]
    pub cancel_reason: String,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayError {
    #[serde(default)]
    pub message: String,
}

/// One line of the streaming watch response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchLine {
    #[serde(default)]
    pub result: Option<WatchResponse>,
    #[serde(default)]
    pub error: Option<GatewayError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_request_encodes_key() {
        let req = RangeRequest::new("/KitexConfig/a");
        assert_eq!(req.key, "L0tpdGV4Q29uZmlnL2E=");
    }

    #[test]
    fn test_range_response_parse() {
        let json = r#"{
            "header": {"cluster_id": "1", "revision": "12"},
            "kvs": [{"key": "L2E=", "value": "djE=", "mod_revision": "7"}],
            "count": "1"
        }"#;
        let resp: RangeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.header.revision, 12);
        assert_eq!(resp.kvs[0].mod_revision, 7);
        assert_eq!(resp.kvs[0].decoded_value().unwrap(), "v1");
    }

    #[test]
    fn test_watch_line_parse() {
        let line = r#"{"result":{"header":{"revision":"13"},"events":[{"type":"DELETE","kv":{"key":"L2E=","mod_revision":"13"}},{"kv":{"key":"L2E=","value":"djI="}}]}}"#;
        let parsed: WatchLine = serde_json::from_str(line).unwrap();
        let result = parsed.result.unwrap();
        assert_eq!(result.header.revision, 13);
        assert_eq!(result.events[0].kind, EventType::Delete);
        assert_eq!(result.events[1].kind, EventType::Put);
        assert_eq!(result.events[1].kv.decoded_value().unwrap(), "v2");
    }

    #[test]
    fn test_undecodable_value_is_an_error() {
        let not_text: KeyValue =
            serde_json::from_str(r#"{"key": "L2E=", "value": "//4="}"#).unwrap();
        assert!(matches!(
            not_text.decoded_value(),
            Err(ClientError::InvalidValue { key, .. }) if key == "/a"
        ));

        let not_base64: KeyValue =
            serde_json::from_str(r#"{"key": "L2E=", "value": "v1!"}"#).unwrap();
        assert!(not_base64.decoded_value().is_err());
    }

    #[test]
    fn test_watch_request_format() {
        let json = serde_json::to_value(WatchRequest::create("/a", 5)).unwrap();
        assert_eq!(json["create_request"]["key"], "L2E=");
        assert_eq!(json["create_request"]["start_revision"], 5);
    }
}
