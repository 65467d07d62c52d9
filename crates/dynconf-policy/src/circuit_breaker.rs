//! Per-method circuit breaker settings
//!
//! Settings are stored under `"{src}/{dest}/{method}"`, the same key the
//! breaker of a call path is looked up by. A method removed from the payload
//! falls back to the default settings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use dynconf_client::{ConfigClient, Result, Watcher};
use dynconf_common::{CATEGORY_CIRCUIT_BREAK, ConfigKey, ConfigParamConfig, ThreadSafeSet};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::subscription::{PolicyConsumer, PolicySubscription, subscribe};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CbConfig {
    #[serde(default)]
    pub enable: bool,
    /// Error rate in `[0, 1]` that opens the breaker
    #[serde(default)]
    pub err_rate: f64,
    /// Minimum calls in the window before the rate is evaluated
    #[serde(default)]
    pub min_sample: i64,
}

impl Default for CbConfig {
    fn default() -> Self {
        Self {
            enable: true,
            err_rate: 0.5,
            min_sample: 200,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreakerContainer {
    src: String,
    dest: String,
    configs: DashMap<String, CbConfig>,
    methods: ThreadSafeSet,
}

impl CircuitBreakerContainer {
    pub fn new(src: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            configs: DashMap::new(),
            methods: ThreadSafeSet::new(),
        }
    }

    /// Breaker key of `method` on this call path
    pub fn breaker_key(&self, method: &str) -> String {
        format!("{}/{}/{}", self.src, self.dest, method)
    }

    /// Settings of the breaker at `key`; unknown keys use the defaults
    pub fn config(&self, breaker_key: &str) -> CbConfig {
        self.configs
            .get(breaker_key)
            .map(|c| *c)
            .unwrap_or_default()
    }

    pub fn config_for_method(&self, method: &str) -> CbConfig {
        self.config(&self.breaker_key(method))
    }

    fn update(&self, method: &str, config: CbConfig) {
        self.configs.insert(self.breaker_key(method), config);
    }
}

impl PolicyConsumer for CircuitBreakerContainer {
    type Config = HashMap<String, CbConfig>;
    const CATEGORY: &'static str = CATEGORY_CIRCUIT_BREAK;

    fn apply(&self, key: &ConfigKey, config: Option<Self::Config>) {
        let config = config.unwrap_or_default();

        let methods: HashSet<String> = config.keys().cloned().collect();
        for method in self.methods.diff_and_emplace(methods) {
            self.update(&method, CbConfig::default());
        }
        for (method, cb) in &config {
            self.update(method, *cb);
        }
        info!(key = %key, methods = config.len(), "Circuit breaker settings updated");
    }
}

/// Subscribe a circuit breaker container to the client-side key of `src -> dest`
pub async fn with_circuit_breaker<W: Watcher>(
    dest: &str,
    src: &str,
    client: &ConfigClient<W>,
) -> Result<PolicySubscription<CircuitBreakerContainer>> {
    let key =
        client.client_config_param(&ConfigParamConfig::new(CATEGORY_CIRCUIT_BREAK, src, dest))?;
    Ok(subscribe(client, key, Arc::new(CircuitBreakerContainer::new(src, dest))).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_method_resets_to_default() {
        let container = CircuitBreakerContainer::new("frontend", "backend");
        let key = ConfigKey::path("/k");
        let strict = CbConfig {
            enable: true,
            err_rate: 0.1,
            min_sample: 10,
        };

        container.apply(&key, Some(HashMap::from([("Echo".to_string(), strict)])));
        assert_eq!(container.config("frontend/backend/Echo"), strict);

        container.apply(&key, Some(HashMap::new()));
        assert_eq!(container.config_for_method("Echo"), CbConfig::default());
    }

    #[test]
    fn test_default_config() {
        let parsed: CbConfig = serde_json::from_str(r#"{"enable": false}"#).unwrap();
        assert!(!parsed.enable);
        assert_eq!(parsed.err_rate, 0.0);

        let container = CircuitBreakerContainer::new("a", "b");
        let default = container.config_for_method("Unknown");
        assert!(default.enable);
        assert_eq!(default.min_sample, 200);
    }
}
