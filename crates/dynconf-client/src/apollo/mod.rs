//! Apollo backend
//!
//! Config items live in namespaces; a key addresses one item
//! (`namespace`, `cluster`, item `key`). Changes are discovered through the
//! `/notifications/v2` long poll and read back from `/configs`.

pub mod model;

use std::time::Duration;

use async_trait::async_trait;
use dynconf_common::{ConfigKey, ConfigParamConfig, DynconfError, KeyTemplate};
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{ClientError, Result};
use crate::watcher::{Payload, Watcher, forward};

use self::model::{ApolloConfig, ApolloConfigNotification};

/// Options for the Apollo backend
#[derive(Debug, Clone)]
pub struct ApolloOptions {
    /// Config service address (e.g. "http://127.0.0.1:8080")
    pub server_addr: String,
    pub app_id: String,
    pub cluster: String,
    /// Template rendering the namespace a policy lives in
    pub namespace_template: String,
    /// Template rendering the item key of a client-side policy
    pub client_key_template: String,
    /// Template rendering the item key of a server-side policy
    pub server_key_template: String,
    pub connect_timeout: Duration,
    /// Timeout of one config read
    pub request_timeout: Duration,
    /// Timeout of one long poll; must exceed the server hold time (60s)
    pub poll_timeout: Duration,
}

impl Default for ApolloOptions {
    fn default() -> Self {
        Self {
            server_addr: "http://127.0.0.1:8080".to_string(),
            app_id: "KitexApp".to_string(),
            cluster: "default".to_string(),
            namespace_template: "{{.Category}}".to_string(),
            client_key_template: "{{.ClientServiceName}}.{{.ServerServiceName}}".to_string(),
            server_key_template: "{{.ServerServiceName}}".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(90),
        }
    }
}

/// Apollo watcher backed by the config service HTTP API
pub struct ApolloWatcher {
    http: Client,
    options: ApolloOptions,
    namespace: KeyTemplate,
    client_key: KeyTemplate,
    server_key: KeyTemplate,
}

impl ApolloWatcher {
    pub fn new(options: ApolloOptions) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()?;
        Ok(Self {
            http,
            namespace: KeyTemplate::parse(&options.namespace_template)?,
            client_key: KeyTemplate::parse(&options.client_key_template)?,
            server_key: KeyTemplate::parse(&options.server_key_template)?,
            options,
        })
    }

    fn base_url(&self) -> &str {
        self.options.server_addr.trim_end_matches('/')
    }

    fn render(&self, item: &KeyTemplate, param: &ConfigParamConfig) -> Result<ConfigKey> {
        let namespace = self.namespace.render(param);
        let key = item.render(param);
        if namespace.is_empty() || key.is_empty() {
            return Err(DynconfError::InvalidKey(format!(
                "apollo namespace {:?} and key {:?} must not be empty",
                namespace, key
            ))
            .into());
        }
        Ok(ConfigKey::new(namespace, self.options.cluster.clone(), key))
    }

    async fn read_namespace(&self, key: &ConfigKey) -> Result<Option<ApolloConfig>> {
        let url = format!(
            "{}/configs/{}/{}/{}",
            self.base_url(),
            self.options.app_id,
            key.cluster,
            key.namespace
        );
        let response = self
            .http
            .get(&url)
            .timeout(self.options.request_timeout)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(ClientError::UnexpectedStatus {
                status: status.as_u16(),
                url,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// One long poll. Returns the new notification id when the namespace
    /// changed, `None` when the server held the request without a change.
    async fn poll(&self, key: &ConfigKey, notification_id: i64) -> Result<Option<i64>> {
        let url = format!("{}/notifications/v2", self.base_url());
        let notifications = serde_json::to_string(&[ApolloConfigNotification::new(
            key.namespace.clone(),
            notification_id,
        )])?;
        let response = self
            .http
            .get(&url)
            .query(&[
                ("appId", self.options.app_id.as_str()),
                ("cluster", key.cluster.as_str()),
                ("notifications", notifications.as_str()),
            ])
            .timeout(self.options.poll_timeout)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(None),
            StatusCode::OK => {
                let changed: Vec<ApolloConfigNotification> = response.json().await?;
                Ok(changed
                    .into_iter()
                    .find(|n| n.namespace_name == key.namespace)
                    .map(|n| n.notification_id))
            }
            status => Err(ClientError::UnexpectedStatus {
                status: status.as_u16(),
                url,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl Watcher for ApolloWatcher {
    fn kind(&self) -> &'static str {
        "apollo"
    }

    fn client_key(&self, param: &ConfigParamConfig) -> Result<ConfigKey> {
        self.render(&self.client_key, param)
    }

    fn server_key(&self, param: &ConfigParamConfig) -> Result<ConfigKey> {
        self.render(&self.server_key, param)
    }

    async fn fetch(&self, key: &ConfigKey) -> Result<Payload> {
        let config = self.read_namespace(key).await?;
        Ok(Payload::from(
            config.and_then(|mut c| c.configurations.remove(&key.key)),
        ))
    }

    async fn watch(
        &self,
        key: &ConfigKey,
        tx: mpsc::Sender<Payload>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut notification_id: i64 = -1;

        let current = self.fetch(key).await?;
        if !forward(&tx, current).await {
            return Ok(());
        }

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                polled = self.poll(key, notification_id) => polled?,
            };

            let Some(next_id) = polled else {
                trace!(key = %key, "Apollo long poll returned without change");
                continue;
            };
            debug!(key = %key, notification_id = next_id, "Apollo namespace changed");
            notification_id = next_id;

            let payload = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                payload = self.fetch(key) => payload?,
            };
            if !forward(&tx, payload).await {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_rendering() {
        let watcher = ApolloWatcher::new(ApolloOptions::default()).unwrap();
        let param = ConfigParamConfig::new("retry", "frontend", "backend");

        assert_eq!(
            watcher.client_key(&param).unwrap(),
            ConfigKey::new("retry", "default", "frontend.backend")
        );
        assert_eq!(
            watcher.server_key(&param).unwrap(),
            ConfigKey::new("retry", "default", "backend")
        );
    }

    #[test]
    fn test_invalid_template_fails_construction() {
        let options = ApolloOptions {
            namespace_template: "{{.Category".to_string(),
            ..Default::default()
        };
        assert!(ApolloWatcher::new(options).is_err());
    }

    #[test]
    fn test_empty_render_rejected() {
        let watcher = ApolloWatcher::new(ApolloOptions::default()).unwrap();
        let param = ConfigParamConfig::new("", "frontend", "backend");
        assert!(watcher.client_key(&param).is_err());
    }
}
