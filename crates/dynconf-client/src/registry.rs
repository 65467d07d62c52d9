//! Per-key multiplexed callback registry
//!
//! The registry is the single source of truth for which subscribers watch
//! which key. A key entry exists exactly while it has at least one
//! subscriber; removing the last subscriber cancels the key's watch.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dynconf_common::{ConfigKey, SubscriberId};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::watcher::{Callback, Payload};

/// One subscriber's registration on a key
#[derive(Clone)]
pub(crate) struct Subscriber {
    pub(crate) id: SubscriberId,
    pub(crate) callback: Callback,
    pub(crate) token: CancellationToken,
}

/// Serializes fan-out of one key with catch-up of joining subscribers
pub(crate) type DeliveryLock = Arc<Mutex<()>>;

struct KeyEntry {
    generation: u64,
    token: CancellationToken,
    delivery: DeliveryLock,
    subscribers: HashMap<SubscriberId, Subscriber>,
    last_delivered: Option<Payload>,
}

/// Result of adding a subscriber
pub(crate) enum Registration {
    /// The key was unwatched; the caller must start a watch loop bound to
    /// this token and generation.
    NewKey {
        token: CancellationToken,
        generation: u64,
        delivery: DeliveryLock,
    },
    /// The key already has a running watch loop. The joining subscriber must
    /// catch up with [`CallbackRegistry::last_delivered`] while holding
    /// `delivery`.
    Existing { delivery: DeliveryLock },
}

/// Result of removing a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deregistration {
    /// The `(key, subscriber)` pair was not registered
    NotFound,
    /// The subscriber was removed; others still watch the key
    Removed,
    /// The last subscriber was removed and the key's watch was cancelled
    LastRemoved,
}

/// Mapping from config key to its subscribers, guarded by one mutex.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Mutex<HashMap<ConfigKey, KeyEntry>>,
    generations: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the callback for `(key, id)`.
    ///
    /// `seed` is the value the caller already observed for the key; the watch
    /// loop skips it if its first observation is the same.
    pub(crate) fn register(
        &self,
        key: &ConfigKey,
        id: SubscriberId,
        callback: Callback,
        seed: Option<Payload>,
    ) -> Registration {
        let mut entries = self.entries.lock();

        let mut created = false;
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            created = true;
            KeyEntry {
                generation: self.generations.fetch_add(1, Ordering::Relaxed) + 1,
                token: CancellationToken::new(),
                delivery: DeliveryLock::default(),
                subscribers: HashMap::new(),
                last_delivered: seed,
            }
        });

        let subscriber = Subscriber {
            id,
            callback,
            token: entry.token.child_token(),
        };
        if let Some(previous) = entry.subscribers.insert(id, subscriber) {
            previous.token.cancel();
        }

        if created {
            Registration::NewKey {
                token: entry.token.clone(),
                generation: entry.generation,
                delivery: entry.delivery.clone(),
            }
        } else {
            Registration::Existing {
                delivery: entry.delivery.clone(),
            }
        }
    }

    /// Last payload fanned out for `key`, or the seed if nothing was yet
    pub(crate) fn last_delivered(&self, key: &ConfigKey) -> Option<Payload> {
        self.entries
            .lock()
            .get(key)
            .and_then(|entry| entry.last_delivered.clone())
    }

    /// Remove `(key, id)`, cancelling its token, and tear the key down if it
    /// was the last subscriber.
    pub fn deregister(&self, key: &ConfigKey, id: SubscriberId) -> Deregistration {
        let mut entries = self.entries.lock();

        let Some(entry) = entries.get_mut(key) else {
            return Deregistration::NotFound;
        };
        let Some(subscriber) = entry.subscribers.remove(&id) else {
            return Deregistration::NotFound;
        };
        subscriber.token.cancel();

        if entry.subscribers.is_empty() {
            if let Some(entry) = entries.remove(key) {
                entry.token.cancel();
            }
            Deregistration::LastRemoved
        } else {
            Deregistration::Removed
        }
    }

    /// Record `payload` as delivered by the watch loop of `generation` and
    /// return the subscribers to notify.
    ///
    /// Returns `None` when the loop is stale (the key was torn down or
    /// re-created) or when the payload equals the last delivered one.
    pub(crate) fn prepare_delivery(
        &self,
        key: &ConfigKey,
        generation: u64,
        payload: &Payload,
    ) -> Option<Vec<Subscriber>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        if entry.generation != generation {
            return None;
        }
        if entry.last_delivered.as_ref() == Some(payload) {
            return None;
        }
        entry.last_delivered = Some(payload.clone());

        let mut subscribers: Vec<Subscriber> = entry.subscribers.values().cloned().collect();
        subscribers.sort_by_key(|s| s.id);
        Some(subscribers)
    }

    pub fn is_watched(&self, key: &ConfigKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn subscriber_count(&self, key: &ConfigKey) -> usize {
        self.entries
            .lock()
            .get(key)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<ConfigKey> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Drop every registration and cancel every watch
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        for (_, entry) in entries.drain() {
            entry.token.cancel();
        }
    }
}
