//! Error types for dynconf

use crate::parser::ConfigType;

/// Errors raised while preparing keys or decoding payloads
#[derive(thiserror::Error, Debug)]
pub enum DynconfError {
    #[error("template error: {0}")]
    Template(String),

    #[error("invalid config key: {0}")]
    InvalidKey(String),

    #[error("decode {kind} payload failed: {message}")]
    Decode { kind: ConfigType, message: String },

    #[error("unsupported config type: {0}")]
    UnsupportedType(String),
}

pub type Result<T> = std::result::Result<T, DynconfError>;
