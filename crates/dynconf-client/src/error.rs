//! Client error types for dynconf backends

use dynconf_common::DynconfError;

/// Error type for config client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] DynconfError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "zookeeper")]
    #[error("zookeeper error: {0}")]
    ZooKeeper(#[from] zookeeper_client::Error),

    #[error("request to {url} failed with status {status}: {body}")]
    UnexpectedStatus {
        status: u16,
        url: String,
        body: String,
    },

    #[error("value of {key} is not valid text: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("watch closed by server: {0}")]
    WatchClosed(String),

    #[error("session expired")]
    SessionExpired,

    #[error("request timeout")]
    Timeout,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClientError::Timeout;
        assert_eq!(err.to_string(), "request timeout");

        let err = ClientError::UnexpectedStatus {
            status: 500,
            url: "http://127.0.0.1:8500/v1/kv/a".to_string(),
            body: "boom".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "request to http://127.0.0.1:8500/v1/kv/a failed with status 500: boom"
        );

        let err = ClientError::InvalidValue {
            key: "/a".to_string(),
            reason: "invalid utf-8".to_string(),
        };
        assert_eq!(err.to_string(), "value of /a is not valid text: invalid utf-8");

        let err = ClientError::WatchClosed("compacted".to_string());
        assert_eq!(err.to_string(), "watch closed by server: compacted");
    }

    #[test]
    fn test_from_dynconf_error() {
        let err: ClientError = DynconfError::InvalidKey("empty".to_string()).into();
        assert!(matches!(err, ClientError::Config(_)));
        assert_eq!(err.to_string(), "invalid config key: empty");
    }
}
