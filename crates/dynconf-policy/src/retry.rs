//! Per-method retry policies
//!
//! Payload: `{"<method>": RetryPolicy}`, where `"*"` applies to every method
//! without an entry of its own. A policy carries either a failure policy or
//! a backup policy; entries with both are rejected.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dynconf_client::{ConfigClient, Result, Watcher};
use dynconf_common::{CATEGORY_RETRY, ConfigKey, ConfigParamConfig, ThreadSafeSet, WILDCARD_METHOD};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::subscription::{PolicyConsumer, PolicySubscription, subscribe};

/// Which retry strategy a policy uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RetryType {
    /// Retry after a failed call
    #[default]
    Failure,
    /// Send a backup request when the first is slow
    Backup,
}

impl TryFrom<u8> for RetryType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(RetryType::Failure),
            1 => Ok(RetryType::Backup),
            other => Err(format!("unknown retry type {}", other)),
        }
    }
}

impl From<RetryType> for u8 {
    fn from(value: RetryType) -> Self {
        match value {
            RetryType::Failure => 0,
            RetryType::Backup => 1,
        }
    }
}

/// Circuit breaking of retries themselves
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CbPolicy {
    #[serde(default)]
    pub error_rate: f64,
}

/// When to stop retrying
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopPolicy {
    #[serde(default)]
    pub max_retry_times: u32,
    #[serde(default)]
    pub max_duration_ms: u32,
    #[serde(default)]
    pub disable_chain_stop: bool,
    #[serde(default)]
    pub ddl_stop: bool,
    #[serde(default)]
    pub cb_policy: CbPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffType {
    #[default]
    None,
    Fixed,
    Random,
}

/// Delay between retries; `cfg_items` holds the type's parameters
/// (`fix_ms`, `min_ms`, `max_ms`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(default)]
    pub backoff_type: BackoffType,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cfg_items: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailurePolicy {
    #[serde(default)]
    pub stop_policy: StopPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_policy: Option<BackoffPolicy>,
    #[serde(default)]
    pub retry_same_node: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extra: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupPolicy {
    #[serde(default)]
    pub retry_delay_ms: u32,
    #[serde(default)]
    pub stop_policy: StopPolicy,
    #[serde(default)]
    pub retry_same_node: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub enable: bool,
    #[serde(rename = "type", default)]
    pub kind: RetryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_policy: Option<BackupPolicy>,
}

impl RetryPolicy {
    /// A policy may carry one strategy, not both
    pub fn is_valid(&self) -> bool {
        !(self.failure_policy.is_some() && self.backup_policy.is_some())
    }
}

/// Current retry policy per method
#[derive(Debug, Default)]
pub struct RetryContainer {
    policies: ArcSwap<HashMap<String, RetryPolicy>>,
    methods: ThreadSafeSet,
}

impl RetryContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the policy of `method`
    pub fn notify_policy_change(&self, method: &str, policy: RetryPolicy) {
        self.policies.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(method.to_string(), policy.clone());
            next
        });
    }

    pub fn delete_policy(&self, method: &str) {
        self.policies.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(method);
            next
        });
    }

    /// Policy for `method`, falling back to the wildcard entry
    pub fn policy_for(&self, method: &str) -> Option<RetryPolicy> {
        let policies = self.policies.load();
        policies
            .get(method)
            .or_else(|| policies.get(WILDCARD_METHOD))
            .cloned()
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, RetryPolicy>> {
        self.policies.load_full()
    }
}

impl PolicyConsumer for RetryContainer {
    type Config = HashMap<String, RetryPolicy>;
    const CATEGORY: &'static str = CATEGORY_RETRY;

    fn apply(&self, key: &ConfigKey, config: Option<Self::Config>) {
        let config = config.unwrap_or_default();

        let mut valid = HashMap::with_capacity(config.len());
        for (method, policy) in config {
            if policy.is_valid() {
                valid.insert(method, policy);
            } else {
                warn!(key = %key, method = %method, "Retry policy sets both failure and backup policy, ignored");
            }
        }

        let methods: HashSet<String> = valid.keys().cloned().collect();
        for method in self.methods.diff_and_emplace(methods) {
            self.delete_policy(&method);
        }
        for (method, policy) in valid {
            self.notify_policy_change(&method, policy);
        }
        info!(key = %key, methods = self.methods.len(), "Retry policies updated");
    }
}

/// Subscribe a retry container to the client-side retry key of `src -> dest`
pub async fn with_retry_policy<W: Watcher>(
    dest: &str,
    src: &str,
    client: &ConfigClient<W>,
) -> Result<PolicySubscription<RetryContainer>> {
    let key = client.client_config_param(&ConfigParamConfig::new(CATEGORY_RETRY, src, dest))?;
    Ok(subscribe(client, key, Arc::new(RetryContainer::new())).await)
}
