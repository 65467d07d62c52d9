//! Backend watch abstraction and change notification types

use std::sync::Arc;

use async_trait::async_trait;
use dynconf_common::{
    ConfigKey, ConfigParamConfig, ConfigParser, ConfigType, DynconfError, KeyTemplate, decode,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ClientError, Result};

/// Value of a config key as observed in the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Data(String),
    /// The key does not exist (never created, or deleted). Subscribers
    /// restore their default policy.
    Absent,
}

impl Payload {
    pub fn data(&self) -> Option<&str> {
        match self {
            Payload::Data(data) => Some(data),
            Payload::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Payload::Absent)
    }
}

impl From<Option<String>> for Payload {
    fn from(value: Option<String>) -> Self {
        value.map(Payload::Data).unwrap_or(Payload::Absent)
    }
}

/// A change delivered to a subscriber callback.
pub struct Notification<'a> {
    pub key: &'a ConfigKey,
    pub payload: &'a Payload,
    pub parser: &'a dyn ConfigParser,
    pub config_type: ConfigType,
}

impl Notification<'_> {
    /// Decode the payload into `T`. Returns `Ok(None)` when the key is absent.
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<Option<T>, DynconfError> {
        match self.payload {
            Payload::Data(data) => decode(self.parser, self.config_type, data).map(Some),
            Payload::Absent => Ok(None),
        }
    }
}

/// Subscriber callback invoked on every change of its key.
pub type Callback = Arc<dyn Fn(&Notification<'_>) + Send + Sync>;

/// A config backend capable of reading and watching keys.
///
/// The registry, fan-out and restart logic are written once against this
/// trait; each backend only supplies key rendering, a one-shot fetch and a
/// long-lived watch.
#[async_trait]
pub trait Watcher: Send + Sync + 'static {
    /// Short backend name used in logs
    fn kind(&self) -> &'static str;

    /// Render the key a client-side policy of `param` is stored under
    fn client_key(&self, param: &ConfigParamConfig) -> Result<ConfigKey>;

    /// Render the key a server-side policy of `param` is stored under
    fn server_key(&self, param: &ConfigParamConfig) -> Result<ConfigKey>;

    /// Read the current value of `key`
    async fn fetch(&self, key: &ConfigKey) -> Result<Payload>;

    /// Watch `key` until `cancel` fires.
    ///
    /// Sends the value observed when the watch is established, then every
    /// change. Returns `Ok(())` on cancellation or when `tx` is closed, and
    /// an error when the backend watch breaks.
    async fn watch(
        &self,
        key: &ConfigKey,
        tx: mpsc::Sender<Payload>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Forward a payload to the watch loop. Returns `false` once the loop is gone.
pub(crate) async fn forward(tx: &mpsc::Sender<Payload>, payload: Payload) -> bool {
    tx.send(payload).await.is_ok()
}

/// Text of a raw stored value; bytes that are not UTF-8 are an
/// [`ClientError::InvalidValue`].
pub(crate) fn value_text(key: &str, raw: Vec<u8>) -> Result<String> {
    String::from_utf8(raw).map_err(|e| ClientError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Forward a value read by a watch. An unreadable value is logged and
/// skipped so subscribers keep their previous policy. Returns `false` once
/// the loop is gone.
pub(crate) async fn forward_value(
    tx: &mpsc::Sender<Payload>,
    key: &ConfigKey,
    value: Result<Payload>,
) -> bool {
    match value {
        Ok(payload) => forward(tx, payload).await,
        Err(e) => {
            warn!(key = %key, error = %e, "Skipping unreadable config value");
            true
        }
    }
}

/// Key layout shared by the path-addressed backends: `{prefix}/{rendered}`.
#[derive(Debug, Clone)]
pub struct PathLayout {
    prefix: String,
    client: KeyTemplate,
    server: KeyTemplate,
}

impl PathLayout {
    pub fn new(prefix: &str, client_template: &str, server_template: &str) -> Result<Self> {
        Ok(Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            client: KeyTemplate::parse(client_template)?,
            server: KeyTemplate::parse(server_template)?,
        })
    }

    pub fn client_key(&self, param: &ConfigParamConfig) -> Result<ConfigKey> {
        self.join(self.client.render(param))
    }

    pub fn server_key(&self, param: &ConfigParamConfig) -> Result<ConfigKey> {
        self.join(self.server.render(param))
    }

    fn join(&self, rendered: String) -> Result<ConfigKey> {
        let rendered = rendered.trim_start_matches('/');
        if rendered.is_empty() {
            return Err(DynconfError::InvalidKey("rendered path is empty".to_string()).into());
        }
        if self.prefix.is_empty() {
            Ok(ConfigKey::path(rendered))
        } else {
            Ok(ConfigKey::path(format!("{}/{}", self.prefix, rendered)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynconf_common::DefaultParser;
    use std::collections::HashMap;

    #[test]
    fn test_payload_from_option() {
        assert_eq!(Payload::from(Some("x".to_string())), Payload::Data("x".to_string()));
        assert_eq!(Payload::from(None), Payload::Absent);
        assert!(Payload::Absent.is_absent());
        assert_eq!(Payload::Data("y".to_string()).data(), Some("y"));
    }

    #[test]
    fn test_notification_decode() {
        let key = ConfigKey::path("k");
        let payload = Payload::Data(r#"{"a": 1}"#.to_string());
        let notification = Notification {
            key: &key,
            payload: &payload,
            parser: &DefaultParser,
            config_type: ConfigType::Json,
        };
        let decoded: Option<HashMap<String, i32>> = notification.decode().unwrap();
        assert_eq!(decoded.unwrap()["a"], 1);

        let absent = Payload::Absent;
        let notification = Notification {
            key: &key,
            payload: &absent,
            parser: &DefaultParser,
            config_type: ConfigType::Json,
        };
        assert!(notification.decode::<HashMap<String, i32>>().unwrap().is_none());
    }

    #[test]
    fn test_value_text() {
        assert_eq!(value_text("/a", b"v1".to_vec()).unwrap(), "v1");
        let err = value_text("/a", vec![0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, ClientError::InvalidValue { key, .. } if key == "/a"));
    }

    #[tokio::test]
    async fn test_forward_value_skips_unreadable() {
        let (tx, mut rx) = mpsc::channel(4);
        let key = ConfigKey::path("/a");
        let unreadable = value_text("/a", vec![0xff]).map(Payload::Data);

        assert!(forward_value(&tx, &key, unreadable).await);
        assert!(forward_value(&tx, &key, Ok(Payload::Absent)).await);
        assert_eq!(rx.recv().await, Some(Payload::Absent));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_path_layout() {
        let layout = PathLayout::new(
            "/KitexConfig/",
            "{{.ClientServiceName}}/{{.ServerServiceName}}/{{.Category}}",
            "{{.ServerServiceName}}/{{.Category}}",
        )
        .unwrap();
        let param = ConfigParamConfig::new("retry", "frontend", "backend");
        assert_eq!(
            layout.client_key(&param).unwrap(),
            ConfigKey::path("/KitexConfig/frontend/backend/retry")
        );
        assert_eq!(
            layout.server_key(&param).unwrap(),
            ConfigKey::path("/KitexConfig/backend/retry")
        );
    }

    #[test]
    fn test_path_layout_without_prefix() {
        let layout = PathLayout::new("", "{{.Category}}", "{{.Category}}").unwrap();
        let param = ConfigParamConfig::new("limit", "", "svc");
        assert_eq!(layout.server_key(&param).unwrap(), ConfigKey::path("limit"));
    }

    #[test]
    fn test_path_layout_rejects_empty_render() {
        let layout = PathLayout::new("/p", "{{.ClientServiceName}}", "{{.Category}}").unwrap();
        let param = ConfigParamConfig::new("retry", "", "svc");
        assert!(layout.client_key(&param).is_err());
    }

    #[test]
    fn test_path_layout_rejects_bad_template() {
        assert!(PathLayout::new("/p", "{{.Nope}}", "{{.Category}}").is_err());
    }
}
