//! Pluggable config payload parsing
//!
//! A [`ConfigParser`] turns raw payload text into a generic document; the
//! typed [`decode`] helper then deserializes that document into a concrete
//! policy type.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DynconfError, Result};

/// Payload encodings understood by the default parser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    #[default]
    Json,
    Yaml,
    Toml,
}

impl ConfigType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigType::Json => "json",
            ConfigType::Yaml => "yaml",
            ConfigType::Toml => "toml",
        }
    }
}

impl Display for ConfigType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConfigType {
    type Err = DynconfError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ConfigType::Json),
            "yaml" | "yml" => Ok(ConfigType::Yaml),
            "toml" => Ok(ConfigType::Toml),
            other => Err(DynconfError::UnsupportedType(other.to_string())),
        }
    }
}

/// Decodes raw payload text into a generic document.
///
/// Implement this to support custom encodings or preprocessing (decryption,
/// envelope stripping) before policies are typed.
pub trait ConfigParser: Send + Sync + 'static {
    fn decode(&self, kind: ConfigType, data: &str) -> Result<serde_json::Value>;
}

/// Parser backed by serde_json, serde_yaml and toml
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultParser;

impl ConfigParser for DefaultParser {
    fn decode(&self, kind: ConfigType, data: &str) -> Result<serde_json::Value> {
        let decoded: std::result::Result<serde_json::Value, String> = match kind {
            ConfigType::Json => serde_json::from_str(data).map_err(|e| e.to_string()),
            ConfigType::Yaml => serde_yaml::from_str(data).map_err(|e| e.to_string()),
            ConfigType::Toml => toml::from_str(data).map_err(|e| e.to_string()),
        };
        decoded.map_err(|message| DynconfError::Decode { kind, message })
    }
}

/// Decode a payload into `T` through the given parser
pub fn decode<T: DeserializeOwned>(
    parser: &dyn ConfigParser,
    kind: ConfigType,
    data: &str,
) -> Result<T> {
    let document = parser.decode(kind, data)?;
    serde_json::from_value(document).map_err(|e| DynconfError::Decode {
        kind,
        message: e.to_string(),
    })
}
