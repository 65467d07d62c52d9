//! Generic config client over any [`Watcher`] backend

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dynconf_common::{
    ConfigKey, ConfigParamConfig, ConfigParser, ConfigType, DefaultParser, SubscriberId,
    SubscriberIds,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::{CallbackRegistry, Deregistration, Registration};
use crate::watch_loop::{ParserState, RestartPolicy, WatchLoop, WatchStatus, invoke};
use crate::watcher::{Callback, Notification, Payload, Watcher};

/// Options shared by every backend client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Encoding of config payloads
    pub config_type: ConfigType,
    /// Bound on the initial fetch performed at registration
    pub fetch_timeout: Duration,
    /// Backoff used when a backend watch breaks
    pub restart: RestartPolicy,
    /// Capacity of the health broadcast channel
    pub health_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            config_type: ConfigType::Json,
            fetch_timeout: Duration::from_secs(5),
            restart: RestartPolicy::default(),
            health_capacity: 64,
        }
    }
}

impl ClientOptions {
    pub fn with_config_type(mut self, config_type: ConfigType) -> Self {
        self.config_type = config_type;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

struct Inner<W: Watcher> {
    watcher: Arc<W>,
    registry: Arc<CallbackRegistry>,
    parser: Arc<ArcSwap<ParserState>>,
    health: broadcast::Sender<WatchStatus>,
    ids: SubscriberIds,
    options: ClientOptions,
}

impl<W: Watcher> Drop for Inner<W> {
    fn drop(&mut self) {
        self.registry.clear();
    }
}

/// Config-center client: renders keys, delivers the current value of a key
/// to new subscribers and fans backend changes out to them.
///
/// Cloning is cheap; clones share registrations. Dropping the last clone
/// cancels every watch.
pub struct ConfigClient<W: Watcher> {
    inner: Arc<Inner<W>>,
}

impl<W: Watcher> Clone for ConfigClient<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W: Watcher> ConfigClient<W> {
    pub fn new(watcher: W, options: ClientOptions) -> Self {
        let (health, _) = broadcast::channel(options.health_capacity.max(1));
        let parser = ParserState {
            parser: Arc::new(DefaultParser),
            config_type: options.config_type,
        };
        Self {
            inner: Arc::new(Inner {
                watcher: Arc::new(watcher),
                registry: Arc::new(CallbackRegistry::new()),
                parser: Arc::new(ArcSwap::from_pointee(parser)),
                health,
                ids: SubscriberIds::new(),
                options,
            }),
        }
    }

    /// Replace the payload parser. Applies to notifications delivered after
    /// the call.
    pub fn set_parser(&self, parser: impl ConfigParser) {
        let config_type = self.inner.parser.load().config_type;
        self.inner.parser.store(Arc::new(ParserState {
            parser: Arc::new(parser),
            config_type,
        }));
    }

    pub fn config_type(&self) -> ConfigType {
        self.inner.parser.load().config_type
    }

    pub fn watcher(&self) -> &W {
        &self.inner.watcher
    }

    /// Key of a client-side policy
    pub fn client_config_param(&self, param: &ConfigParamConfig) -> Result<ConfigKey> {
        self.inner.watcher.client_key(param)
    }

    /// Key of a server-side policy
    pub fn server_config_param(&self, param: &ConfigParamConfig) -> Result<ConfigKey> {
        self.inner.watcher.server_key(param)
    }

    /// Allocate a subscriber id unique to this client
    pub fn next_subscriber_id(&self) -> SubscriberId {
        self.inner.ids.next()
    }

    /// Subscribe `callback` to `key` under `id`.
    ///
    /// The callback is invoked once with the current value (or
    /// [`Payload::Absent`]) before this returns, then on every change. If the
    /// initial fetch fails it is logged and only changes are delivered.
    /// Registering an existing `(key, id)` pair replaces its callback.
    pub async fn register_config_callback<F>(&self, key: &ConfigKey, id: SubscriberId, callback: F)
    where
        F: Fn(&Notification<'_>) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let backend = self.inner.watcher.kind();

        let initial = match tokio::time::timeout(
            self.inner.options.fetch_timeout,
            self.inner.watcher.fetch(key),
        )
        .await
        {
            Ok(Ok(payload)) => Some(payload),
            Ok(Err(e)) => {
                warn!(backend, key = %key, error = %e, "Initial config fetch failed");
                None
            }
            Err(_) => {
                warn!(
                    backend,
                    key = %key,
                    timeout_ms = self.inner.options.fetch_timeout.as_millis() as u64,
                    "Initial config fetch timed out"
                );
                None
            }
        };

        if let Some(payload) = &initial {
            let state = self.inner.parser.load();
            invoke(&callback, key, payload, &state, id);
        }

        match self
            .inner
            .registry
            .register(key, id, callback.clone(), initial.clone())
        {
            Registration::NewKey {
                token,
                generation,
                delivery,
            } => {
                WatchLoop {
                    watcher: self.inner.watcher.clone(),
                    registry: self.inner.registry.clone(),
                    parser: self.inner.parser.clone(),
                    health: self.inner.health.clone(),
                    restart: self.inner.options.restart.clone(),
                    key: key.clone(),
                    generation,
                    token,
                    delivery,
                }
                .spawn();
                info!(backend, key = %key, subscriber = id, "Started watching config");
            }
            Registration::Existing { delivery } => {
                debug!(backend, key = %key, subscriber = id, "Joined existing config watch");
                // A change fanned out between our fetch and registration
                // skipped this subscriber.
                let _delivery = delivery.lock();
                if let Some(latest) = self.inner.registry.last_delivered(key)
                    && initial.as_ref() != Some(&latest)
                {
                    debug!(key = %key, subscriber = id, "Catching up joining subscriber");
                    let state = self.inner.parser.load();
                    invoke(&callback, key, &latest, &state, id);
                }
            }
        }
    }

    /// Remove the `(key, id)` subscription. Unknown pairs are ignored.
    pub fn deregister_config(&self, key: &ConfigKey, id: SubscriberId) {
        match self.inner.registry.deregister(key, id) {
            Deregistration::NotFound => {
                debug!(key = %key, subscriber = id, "Deregister of unknown subscription ignored");
            }
            Deregistration::Removed => {
                debug!(key = %key, subscriber = id, "Config subscriber removed");
            }
            Deregistration::LastRemoved => {
                info!(key = %key, subscriber = id, "Stopped watching config");
            }
        }
    }

    /// Read the current value of `key` without subscribing
    pub async fn get(&self, key: &ConfigKey) -> Result<Payload> {
        tokio::time::timeout(self.inner.options.fetch_timeout, self.inner.watcher.fetch(key))
            .await
            .map_err(|_| crate::error::ClientError::Timeout)?
    }

    /// Receive watch health events
    pub fn health(&self) -> broadcast::Receiver<WatchStatus> {
        self.inner.health.subscribe()
    }

    pub fn watched_keys(&self) -> Vec<ConfigKey> {
        self.inner.registry.keys()
    }

    pub fn subscriber_count(&self, key: &ConfigKey) -> usize {
        self.inner.registry.subscriber_count(key)
    }

    /// Drop every subscription and stop every watch
    pub fn close(&self) {
        self.inner.registry.clear();
        info!(backend = self.inner.watcher.kind(), "Config client closed");
    }
}
