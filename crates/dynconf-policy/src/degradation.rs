//! Probabilistic request degradation

use std::sync::Arc;

use arc_swap::ArcSwap;
use dynconf_client::{ConfigClient, Result, Watcher};
use dynconf_common::{CATEGORY_DEGRADATION, ConfigKey, ConfigParamConfig};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::subscription::{PolicyConsumer, PolicySubscription, subscribe};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradationConfig {
    #[serde(default)]
    pub enable: bool,
    /// Share of requests rejected, in percent
    #[serde(default)]
    pub percentage: u32,
}

#[derive(Debug, Default)]
pub struct DegradationContainer {
    config: ArcSwap<DegradationConfig>,
}

impl DegradationContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> DegradationConfig {
        **self.config.load()
    }

    /// Whether the next request should be dropped
    pub fn should_reject(&self) -> bool {
        let config = self.config.load();
        if !config.enable || config.percentage == 0 {
            return false;
        }
        if config.percentage >= 100 {
            return true;
        }
        rand::rng().random_range(0..100) < config.percentage
    }
}

impl PolicyConsumer for DegradationContainer {
    type Config = DegradationConfig;
    const CATEGORY: &'static str = CATEGORY_DEGRADATION;

    fn apply(&self, key: &ConfigKey, config: Option<Self::Config>) {
        let config = config.unwrap_or_default();
        info!(key = %key, enable = config.enable, percentage = config.percentage, "Degradation updated");
        self.config.store(Arc::new(config));
    }
}

/// Subscribe a degradation container to the client-side key of `src -> dest`
pub async fn with_degradation<W: Watcher>(
    dest: &str,
    src: &str,
    client: &ConfigClient<W>,
) -> Result<PolicySubscription<DegradationContainer>> {
    let key =
        client.client_config_param(&ConfigParamConfig::new(CATEGORY_DEGRADATION, src, dest))?;
    Ok(subscribe(client, key, Arc::new(DegradationContainer::new())).await)
}
