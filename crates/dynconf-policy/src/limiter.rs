//! Server-side connection and QPS limits
//!
//! A limit of zero or less means unlimited. QPS is enforced with a token
//! bucket holding one second of tokens; updating the limit rebuilds the
//! bucket.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use arc_swap::ArcSwap;
use dynconf_client::{ConfigClient, Result, Watcher};
use dynconf_common::{CATEGORY_LIMIT, ConfigKey, ConfigParamConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::subscription::{PolicyConsumer, PolicySubscription, subscribe};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default, alias = "connectionLimit")]
    pub connection_limit: i64,
    #[serde(default, alias = "qpsLimit")]
    pub qps_limit: i64,
}

/// Token bucket refilled continuously at `rate` tokens per second
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(qps: i64) -> Self {
        let capacity = qps.max(0) as f64;
        Self {
            capacity,
            rate: capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Live limits of a server
#[derive(Debug)]
pub struct LimiterContainer {
    config: ArcSwap<LimiterConfig>,
    bucket: Mutex<TokenBucket>,
    connections: AtomicI64,
}

impl Default for LimiterContainer {
    fn default() -> Self {
        Self {
            config: ArcSwap::from_pointee(LimiterConfig::default()),
            bucket: Mutex::new(TokenBucket::new(0)),
            connections: AtomicI64::new(0),
        }
    }
}

impl LimiterContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> LimiterConfig {
        **self.config.load()
    }

    /// Admit one request under the QPS limit
    pub fn acquire_qps(&self) -> bool {
        if self.config.load().qps_limit <= 0 {
            return true;
        }
        self.bucket.lock().try_acquire()
    }

    /// Admit one connection under the connection limit. An admitted
    /// connection must be released with [`Self::release_connection`].
    pub fn acquire_connection(&self) -> bool {
        let limit = self.config.load().connection_limit;
        let current = self.connections.fetch_add(1, Ordering::AcqRel) + 1;
        if limit > 0 && current > limit {
            self.connections.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn release_connection(&self) {
        self.connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::Acquire)
    }
}

impl PolicyConsumer for LimiterContainer {
    type Config = LimiterConfig;
    const CATEGORY: &'static str = CATEGORY_LIMIT;

    fn apply(&self, key: &ConfigKey, config: Option<Self::Config>) {
        let config = config.unwrap_or_default();
        let mut bucket = self.bucket.lock();
        *bucket = TokenBucket::new(config.qps_limit);
        self.config.store(Arc::new(config));
        info!(
            key = %key,
            connection_limit = config.connection_limit,
            qps_limit = config.qps_limit,
            "Limiter updated"
        );
    }
}

/// Subscribe a limiter container to the server-side limit key of `service`
pub async fn with_limiter<W: Watcher>(
    service: &str,
    client: &ConfigClient<W>,
) -> Result<PolicySubscription<LimiterContainer>> {
    let key = client.server_config_param(&ConfigParamConfig::new(CATEGORY_LIMIT, "", service))?;
    Ok(subscribe(client, key, Arc::new(LimiterContainer::new())).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limited(connection_limit: i64, qps_limit: i64) -> LimiterContainer {
        let container = LimiterContainer::new();
        container.apply(
            &ConfigKey::path("/k"),
            Some(LimiterConfig {
                connection_limit,
                qps_limit,
            }),
        );
        container
    }

    #[test]
    fn test_zero_is_unlimited() {
        let container = LimiterContainer::new();
        assert!((0..1000).all(|_| container.acquire_qps()));
        assert!((0..1000).all(|_| container.acquire_connection()));
    }

    #[test]
    fn test_connection_limit() {
        let container = limited(2, 0);
        assert!(container.acquire_connection());
        assert!(container.acquire_connection());
        assert!(!container.acquire_connection());
        assert_eq!(container.connections(), 2);

        container.release_connection();
        assert!(container.acquire_connection());
    }

    #[test]
    fn test_qps_bucket_refills() {
        let container = limited(0, 10);
        assert!((0..10).all(|_| container.acquire_qps()));
        assert!(!container.acquire_qps());

        std::thread::sleep(Duration::from_millis(150));
        assert!(container.acquire_qps());
    }

    #[test]
    fn test_camel_case_payload() {
        let config: LimiterConfig =
            serde_json::from_str(r#"{"connectionLimit": 100, "qpsLimit": 1000}"#).unwrap();
        assert_eq!(config.connection_limit, 100);
        assert_eq!(config.qps_limit, 1000);
    }
}
