//! Consul backend
//!
//! Keys are watched with KV blocking queries: each request carries the last
//! `X-Consul-Index` and is held by the agent until the key changes or the
//! wait time elapses.

pub mod model;

use std::time::Duration;

use async_trait::async_trait;
use dynconf_common::{ConfigKey, ConfigParamConfig};
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{ClientError, Result};
use crate::watcher::{PathLayout, Payload, Watcher, forward_value};

use self::model::{CONSUL_INDEX_HEADER, CONSUL_TOKEN_HEADER, KVPair};

/// Options for the Consul backend
#[derive(Debug, Clone)]
pub struct ConsulOptions {
    /// Agent address (e.g. "http://127.0.0.1:8500")
    pub addr: String,
    pub token: Option<String>,
    pub datacenter: Option<String>,
    pub prefix: String,
    pub client_path_template: String,
    pub server_path_template: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Maximum time the agent holds a blocking query
    pub wait: Duration,
    /// Lower bound between two blocking queries of one key
    pub min_query_interval: Duration,
}

impl Default for ConsulOptions {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:8500".to_string(),
            token: None,
            datacenter: None,
            prefix: "KitexConfig".to_string(),
            client_path_template: "{{.ClientServiceName}}/{{.ServerServiceName}}/{{.Category}}"
                .to_string(),
            server_path_template: "{{.ServerServiceName}}/{{.Category}}".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            wait: Duration::from_secs(55),
            min_query_interval: Duration::from_millis(100),
        }
    }
}

/// Result of one KV read; `payload` is an error when the stored value is
/// not text
#[derive(Debug)]
struct KvRead {
    payload: Result<Payload>,
    index: u64,
}

/// Consul watcher backed by the agent HTTP API
pub struct ConsulWatcher {
    http: Client,
    options: ConsulOptions,
    layout: PathLayout,
}

impl ConsulWatcher {
    pub fn new(options: ConsulOptions) -> Result<Self> {
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
        })
    }

    /// Read `key`, blocking on the agent when `index` is given.
    async fn read(&self, key: &ConfigKey, index: Option<u64>) -> Result<KvRead> {
        let url = format!(
            "{}/v1/kv/{}",
            self.options.addr.trim_end_matches('/'),
            key.key.trim_start_matches('/')
        );

        let mut request = self.http.get(&url);
        if let Some(dc) = &self.options.datacenter {
            request = request.query(&[("dc", dc.as_str())]);
        }
        if let Some(token) = &self.options.token {
            request = request.header(CONSUL_TOKEN_HEADER, token.as_str());
        }
        request = match index {
            Some(index) => {
                // The agent adds up to wait/16 of jitter to the hold time
                let wait = self.options.wait;
                request
                    .query(&[
                        ("index", index.to_string()),
                        ("wait", format!("{}s", wait.as_secs().max(1))),
                    ])
                    .timeout(wait + wait / 16 + self.options.request_timeout)
            }
            None => request.timeout(self.options.request_timeout),
        };

        let response = request.send().await?;
        let index = response
            .headers()
            .get(CONSUL_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        match response.status() {
            StatusCode::NOT_FOUND => Ok(KvRead {
                payload: Ok(Payload::Absent),
                index,
            }),
            status if status.is_success() => {
                let pairs: Vec<KVPair> = response.json().await?;
                Ok(KvRead {
                    payload: match pairs.first() {
                        Some(pair) => pair.decoded_value().map(Payload::Data),
                        None => Ok(Payload::Absent),
                    },
                    index,
                })
            }
            status => Err(ClientError::UnexpectedStatus {
                status: status.as_u16(),
                url,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

/// Index to send with the next blocking query.
///
/// An index that went backwards (agent restart, snapshot restore) restarts
/// the watch from zero; zero itself never blocks so it is bumped to one.
fn next_index(previous: u64, returned: u64) -> u64 {
    if returned < previous { 0 } else { returned.max(1) }
}

#[async_trait]
impl Watcher for ConsulWatcher {
    fn kind(&self) -> &'static str {
        "consul"
    }

    fn client_key(&self, param: &ConfigParamConfig) -> Result<ConfigKey> {
        self.layout.client_key(param)
    }

    fn server_key(&self, param: &ConfigParamConfig) -> Result<ConfigKey> {
        self.layout.server_key(param)
    }

    async fn fetch(&self, key: &ConfigKey) -> Result<Payload> {
        self.read(key, None).await?.payload
    }

    async fn watch(
        &self,
        key: &ConfigKey,
        tx: mpsc::Sender<Payload>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let current = self.read(key, None).await?;
        if !forward_value(&tx, key, current.payload).await {
            return Ok(());
        }
        let mut index = next_index(0, current.index);

        let mut pacing = tokio::time::interval(self.options.min_query_interval);
        pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = pacing.tick() => {}
            }

            let read = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = self.read(key, Some(index)) => read?,
            };

            if read.index == index {
                trace!(key = %key, index, "Consul blocking query returned without change");
                continue;
            }
            debug!(key = %key, from = index, to = read.index, "Consul key index changed");
            index = next_index(index, read.index);
            if !forward_value(&tx, key, read.payload).await {
                return Ok(());
            }
        }
    }
}
