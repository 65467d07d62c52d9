//! Binding of a policy container to a config key

use std::fmt;
use std::sync::Arc;

use dynconf_client::{ConfigClient, Notification, Watcher};
use dynconf_common::{ConfigKey, SubscriberId};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// A container whose policy is replaced by config updates
pub trait PolicyConsumer: Send + Sync + 'static {
    /// Payload shape stored under the container's key
    type Config: DeserializeOwned;

    /// Category rendered into the config key
    const CATEGORY: &'static str;

    /// Apply a decoded payload; `None` means the key is absent and the
    /// default policy must be restored.
    fn apply(&self, key: &ConfigKey, config: Option<Self::Config>);
}

/// Callback removing a subscription from its client
pub type CloseCallback = Box<dyn FnOnce() + Send + Sync>;

/// A live policy container plus the callback that unsubscribes it
pub struct PolicySubscription<C> {
    container: Arc<C>,
    key: ConfigKey,
    subscriber: SubscriberId,
    close: Option<CloseCallback>,
}

impl<C> PolicySubscription<C> {
    pub fn container(&self) -> &Arc<C> {
        &self.container
    }

    pub fn key(&self) -> &ConfigKey {
        &self.key
    }

    pub fn subscriber(&self) -> SubscriberId {
        self.subscriber
    }

    /// Split into the container and the close callback
    pub fn into_parts(mut self) -> (Arc<C>, CloseCallback) {
        let close = self.close.take().unwrap_or_else(|| Box::new(|| {}));
        (self.container.clone(), close)
    }

    /// Stop receiving updates. The container keeps its last policy.
    pub fn close(mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

impl<C> fmt::Debug for PolicySubscription<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicySubscription")
            .field("key", &self.key)
            .field("subscriber", &self.subscriber)
            .field("open", &self.close.is_some())
            .finish()
    }
}

/// Subscribe `container` to `key`, decoding every payload into
/// `C::Config`. A payload that fails to decode leaves the current policy in
/// place.
pub(crate) async fn subscribe<W, C>(
    client: &ConfigClient<W>,
    key: ConfigKey,
    container: Arc<C>,
) -> PolicySubscription<C>
where
    W: Watcher,
    C: PolicyConsumer,
{
    let subscriber = client.next_subscriber_id();
    let target = container.clone();

    client
        .register_config_callback(&key, subscriber, move |n: &Notification<'_>| {
            match n.decode::<C::Config>() {
                Ok(config) => {
                    debug!(
                        key = %n.key,
                        category = C::CATEGORY,
                        absent = config.is_none(),
                        "Applying policy update"
                    );
                    target.apply(n.key, config);
                }
                Err(e) => {
                    warn!(
                        key = %n.key,
                        category = C::CATEGORY,
                        error = %e,
                        "Skipping undecodable policy payload"
                    );
                }
            }
        })
        .await;

    let closer = client.clone();
    let close_key = key.clone();
    PolicySubscription {
        container,
        key,
        subscriber,
        close: Some(Box::new(move || {
            closer.deregister_config(&close_key, subscriber)
        })),
    }
}
