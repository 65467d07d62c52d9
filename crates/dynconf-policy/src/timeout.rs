//! Per-method RPC timeouts

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dynconf_client::{ConfigClient, Result, Watcher};
use dynconf_common::{
    CATEGORY_RPC_TIMEOUT, ConfigKey, ConfigParamConfig, WILDCARD_METHOD,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::subscription::{PolicyConsumer, PolicySubscription, subscribe};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcTimeout {
    #[serde(default)]
    pub rpc_timeout_ms: u64,
    #[serde(default)]
    pub conn_timeout_ms: u64,
}

impl RpcTimeout {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.conn_timeout_ms)
    }
}

/// Timeouts keyed by method; `"*"` matches methods without their own entry
#[derive(Debug, Default)]
pub struct TimeoutContainer {
    timeouts: ArcSwap<HashMap<String, RpcTimeout>>,
}

impl TimeoutContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout_for(&self, method: &str) -> Option<RpcTimeout> {
        let timeouts = self.timeouts.load();
        timeouts
            .get(method)
            .or_else(|| timeouts.get(WILDCARD_METHOD))
            .copied()
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, RpcTimeout>> {
        self.timeouts.load_full()
    }
}

impl PolicyConsumer for TimeoutContainer {
    type Config = HashMap<String, RpcTimeout>;
    const CATEGORY: &'static str = CATEGORY_RPC_TIMEOUT;

    fn apply(&self, key: &ConfigKey, config: Option<Self::Config>) {
        let config = config.unwrap_or_default();
        info!(key = %key, methods = config.len(), "RPC timeouts updated");
        self.timeouts.store(Arc::new(config));
    }
}

/// Subscribe a timeout container to the client-side timeout key of `src -> dest`
pub async fn with_rpc_timeout<W: Watcher>(
    dest: &str,
    src: &str,
    client: &ConfigClient<W>,
) -> Result<PolicySubscription<TimeoutContainer>> {
    let key =
        client.client_config_param(&ConfigParamConfig::new(CATEGORY_RPC_TIMEOUT, src, dest))?;
    Ok(subscribe(client, key, Arc::new(TimeoutContainer::new())).await)
}
