//! etcd backend over the v3 JSON gateway
//!
//! Reads use `/v3/kv/range`; watches use the streaming `/v3/watch`
//! endpoint, started one revision after the range read so no change between
//! the read and the watch is missed.

pub mod model;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use dynconf_common::{ConfigKey, ConfigParamConfig};
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::watcher::{PathLayout, Payload, Watcher, forward_value};

use self::model::{EventType, RangeRequest, RangeResponse, WatchLine, WatchRequest};

/// Options for the etcd backend
#[derive(Debug, Clone)]
pub struct EtcdOptions {
    /// Gateway endpoints (e.g. ["http://127.0.0.1:2379"])
    pub endpoints: Vec<String>,
    pub prefix: String,
    pub client_path_template: String,
    pub server_path_template: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for EtcdOptions {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            prefix: "/KitexConfig".to_string(),
            client_path_template: "{{.ClientServiceName}}/{{.ServerServiceName}}/{{.Category}}"
                .to_string(),
            server_path_template: "{{.ServerServiceName}}/{{.Category}}".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// etcd watcher with round-robin failover across endpoints
pub struct EtcdWatcher {
    http: Client,
    options: EtcdOptions,
    layout: PathLayout,
    current_endpoint: AtomicUsize,
}

impl EtcdWatcher {
    pub fn new(options: EtcdOptions) -> Result<Self> {
        if options.endpoints.is_empty() {
            return Err(anyhow::anyhow!("at least one etcd endpoint is required").into());
        }
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()?;
        Ok(Self {
            http,
            layout: PathLayout::new(
                &options.prefix,
                &options.client_path_template,
                &options.server_path_template,
            )?,
            options,
            current_endpoint: AtomicUsize::new(0),
        })
    }

    fn endpoint(&self) -> String {
        let index = self.current_endpoint.load(Ordering::Relaxed) % self.options.endpoints.len();
        self.options.endpoints[index].trim_end_matches('/').to_string()
    }

    fn rotate_endpoint(&self) {
        if self.options.endpoints.len() > 1 {
            let next = self.current_endpoint.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(endpoint = %self.options.endpoints[next % self.options.endpoints.len()], "Switched etcd endpoint");
        }
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.endpoint(), path);
        let response = match self
            .http
            .post(&url)
            .json(body)
            .timeout(self.options.request_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.rotate_endpoint();
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::UnexpectedStatus {
                status: status.as_u16(),
                url,
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    async fn range(&self, path: &str) -> Result<RangeResponse> {
        self.post("/v3/kv/range", &RangeRequest::new(path)).await
    }
}

/// Value held by a range response
fn range_value(response: &RangeResponse) -> Result<Payload> {
    match response.kvs.first() {
        Some(kv) => kv.decoded_value().map(Payload::Data),
        None => Ok(Payload::Absent),
    }
}

/// Turn one line of the watch stream into payloads, one per event
fn parse_watch_line(line: &[u8]) -> Result<Vec<Result<Payload>>> {
    let parsed: WatchLine = serde_json::from_slice(line)?;
    if let Some(error) = parsed.error {
        return Err(ClientError::WatchClosed(error.message));
    }
    let Some(result) = parsed.result else {
        return Ok(Vec::new());
    };
    if result.canceled {
        let reason = if result.cancel_reason.is_empty() {
            "watch canceled".to_string()
        } else {
            result.cancel_reason
        };
        return Err(ClientError::WatchClosed(reason));
    }
    Ok(result
        .events
        .into_iter()
        .map(|event| match event.kind {
            EventType::Put => event.kv.decoded_value().map(Payload::Data),
            EventType::Delete => Ok(Payload::Absent),
        })
        .collect())
}

#[async_trait]
impl Watcher for EtcdWatcher {
    fn kind(&self) -> &'static str {
        "etcd"
    }

    fn client_key(&self, param: &ConfigParamConfig) -> Result<ConfigKey> {
        self.layout.client_key(param)
    }

    fn server_key(&self, param: &ConfigParamConfig) -> Result<ConfigKey> {
        self.layout.server_key(param)
    }

    async fn fetch(&self, key: &ConfigKey) -> Result<Payload> {
        range_value(&self.range(&key.key).await?)
    }

    async fn watch(
        &self,
        key: &ConfigKey,
        tx: mpsc::Sender<Payload>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let current = self.range(&key.key).await?;
        let revision = current.header.revision;
        if !forward_value(&tx, key, range_value(&current)).await {
            return Ok(());
        }

        let url = format!("{}/v3/watch", self.endpoint());
        let request = self
            .http
            .post(&url)
            .json(&WatchRequest::create(&key.key, revision + 1))
            .send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            response = request => match response {
                Ok(response) => response,
                Err(e) => {
                    self.rotate_endpoint();
                    return Err(e.into());
                }
            },
        };
        if !response.status().is_success() {
            return Err(ClientError::UnexpectedStatus {
                status: response.status().as_u16(),
                url,
                body: response.text().await.unwrap_or_default(),
            });
        }
        debug!(key = %key, start_revision = revision + 1, "etcd watch established");

        let mut stream = response.bytes_stream();
        let mut buffer = BytesMut::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                let rest = buffer.split();
                let rest = rest.trim_ascii();
                if !rest.is_empty() {
                    for payload in parse_watch_line(rest)? {
                        if !forward_value(&tx, key, payload).await {
                            return Ok(());
                        }
                    }
                }
                warn!(key = %key, "etcd watch stream ended");
                return Err(ClientError::WatchClosed("watch stream ended".to_string()));
            };
            buffer.extend_from_slice(&chunk?);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(pos + 1);
                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                for payload in parse_watch_line(line)? {
                    if !forward_value(&tx, key, payload).await {
                        return Ok(());
                    }
                }
            }
        }
    }
}
