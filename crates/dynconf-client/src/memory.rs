//! In-process config store
//!
//! Useful for tests and for embedding a config source that is fed by the
//! application itself.

use async_trait::async_trait;
use dashmap::DashMap;
use dynconf_common::{ConfigKey, ConfigParamConfig};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result};
use crate::watcher::{PathLayout, Payload, Watcher, forward};

pub const DEFAULT_PREFIX: &str = "/KitexConfig";
pub const DEFAULT_CLIENT_PATH_TEMPLATE: &str =
    "{{.ClientServiceName}}/{{.ServerServiceName}}/{{.Category}}";
pub const DEFAULT_SERVER_PATH_TEMPLATE: &str = "{{.ServerServiceName}}/{{.Category}}";

/// Config store held in memory, keyed by [`ConfigKey`]
pub struct MemoryWatcher {
    layout: PathLayout,
    entries: DashMap<ConfigKey, watch::Sender<Option<String>>>,
}

impl MemoryWatcher {
    /// Store using the default `/KitexConfig` path layout
    pub fn new() -> Self {
        Self::with_layout(
            PathLayout::new(
                DEFAULT_PREFIX,
                DEFAULT_CLIENT_PATH_TEMPLATE,
                DEFAULT_SERVER_PATH_TEMPLATE,
            )
            .unwrap_or_else(|_| unreachable!("default templates are valid")),
        )
    }

    pub fn with_layout(layout: PathLayout) -> Self {
        Self {
            layout,
            entries: DashMap::new(),
        }
    }

    /// Create or replace the value of `key`
    pub fn put(&self, key: &ConfigKey, value: impl Into<String>) {
        self.sender(key).send_replace(Some(value.into()));
    }

    /// Delete `key`
    pub fn delete(&self, key: &ConfigKey) {
        self.sender(key).send_replace(None);
    }

    pub fn get(&self, key: &ConfigKey) -> Option<String> {
        self.entries
            .get(key)
            .and_then(|sender| sender.borrow().clone())
    }

    fn sender(&self, key: &ConfigKey) -> watch::Sender<Option<String>> {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }
}

impl Default for MemoryWatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Watcher for MemoryWatcher {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn client_key(&self, param: &ConfigParamConfig) -> Result<ConfigKey> {
        self.layout.client_key(param)
    }

    fn server_key(&self, param: &ConfigParamConfig) -> Result<ConfigKey> {
        self.layout.server_key(param)
    }

    async fn fetch(&self, key: &ConfigKey) -> Result<Payload> {
        Ok(Payload::from(self.get(key)))
    }

    async fn watch(
        &self,
        key: &ConfigKey,
        tx: mpsc::Sender<Payload>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut rx = self.sender(key).subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if !forward(&tx, Payload::from(current)).await {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ClientError::WatchClosed(format!("store entry {} dropped", key)));
                    }
                }
            }
        }
    }
}
