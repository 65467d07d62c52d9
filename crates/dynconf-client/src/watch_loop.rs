//! Supervised per-key watch loop
//!
//! One loop runs per watched key. It drives the backend watch in a child
//! task, fans every new payload out to the key's subscribers, and restarts
//! the backend watch with exponential backoff when it fails or panics.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dynconf_common::{ConfigKey, ConfigParser, ConfigType};
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::{CallbackRegistry, DeliveryLock};
use crate::watcher::{Callback, Notification, Payload, Watcher};

/// Parser and payload encoding used for notifications
pub(crate) struct ParserState {
    pub(crate) parser: Arc<dyn ConfigParser>,
    pub(crate) config_type: ConfigType,
}

/// Backoff policy for re-establishing a failed watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Give up after this many consecutive failures; `None` retries forever
    pub max_restarts: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_restarts: None,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart `attempt` (1-based), with up to 10% jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        let jitter_ms = (base.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            base
        } else {
            base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_restarts.is_some_and(|max| attempt > max)
    }
}

/// Health of a key's watch, published on the client's health channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchStatus {
    /// The backend watch delivered its first value after (re)starting
    Healthy { key: ConfigKey },
    /// The backend watch failed and will be re-established
    Restarting {
        key: ConfigKey,
        attempt: u32,
        reason: String,
    },
    /// The restart limit is exhausted; the key no longer updates
    Terminated { key: ConfigKey, reason: String },
    /// The watch was cancelled because the key lost its last subscriber
    Stopped { key: ConfigKey },
}

pub(crate) struct WatchLoop<W: Watcher> {
    pub(crate) watcher: Arc<W>,
    pub(crate) registry: Arc<CallbackRegistry>,
    pub(crate) parser: Arc<ArcSwap<ParserState>>,
    pub(crate) health: broadcast::Sender<WatchStatus>,
    pub(crate) restart: RestartPolicy,
    pub(crate) key: ConfigKey,
    pub(crate) generation: u64,
    pub(crate) token: CancellationToken,
    pub(crate) delivery: DeliveryLock,
}

impl<W: Watcher> WatchLoop<W> {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let (tx, mut rx) = mpsc::channel::<Payload>(16);
        let mut attempt: u32 = 0;

        debug!(backend = self.watcher.kind(), key = %self.key, "Watch loop started");

        loop {
            let watcher = self.watcher.clone();
            let key = self.key.clone();
            let sender = tx.clone();
            let cancel = self.token.child_token();
            let mut handle: JoinHandle<crate::error::Result<()>> =
                tokio::spawn(async move { watcher.watch(&key, sender, cancel).await });

            let mut healthy = false;
            let outcome = loop {
                tokio::select! {
                    _ = self.token.cancelled() => {
                        handle.abort();
                        self.stopped();
                        return;
                    }
                    Some(payload) = rx.recv() => {
                        attempt = 0;
                        if !healthy {
                            healthy = true;
                            self.publish(WatchStatus::Healthy { key: self.key.clone() });
                        }
                        self.dispatch(&payload);
                    }
                    joined = &mut handle => break joined,
                }
            };

            while let Ok(payload) = rx.try_recv() {
                self.dispatch(&payload);
            }

            if self.token.is_cancelled() {
                self.stopped();
                return;
            }

            let reason = match outcome {
                Ok(Ok(())) => {
                    debug!(backend = self.watcher.kind(), key = %self.key, "Backend watch ended");
                    "watch ended".to_string()
                }
                Ok(Err(e)) => {
                    warn!(backend = self.watcher.kind(), key = %self.key, error = %e, "Backend watch failed");
                    e.to_string()
                }
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic());
                    error!(backend = self.watcher.kind(), key = %self.key, panic = %message, "Backend watch panicked");
                    format!("panic: {}", message)
                }
                Err(e) => {
                    debug!(key = %self.key, error = %e, "Backend watch task cancelled");
                    self.stopped();
                    return;
                }
            };

            attempt += 1;
            if self.restart.exhausted(attempt) {
                error!(
                    backend = self.watcher.kind(),
                    key = %self.key,
                    attempts = attempt - 1,
                    "Giving up on watch, key will no longer update"
                );
                self.publish(WatchStatus::Terminated {
                    key: self.key.clone(),
                    reason,
                });
                return;
            }

            let delay = self.restart.backoff(attempt);
            info!(key = %self.key, attempt, delay_ms = delay.as_millis() as u64, "Restarting watch");
            self.publish(WatchStatus::Restarting {
                key: self.key.clone(),
                attempt,
                reason,
            });

            tokio::select! {
                _ = self.token.cancelled() => {
                    self.stopped();
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Fan a payload out to a snapshot of the key's subscribers.
    ///
    /// The registry lock is released before any callback runs. The delivery
    /// lock is held throughout so a joining subscriber cannot interleave its
    /// catch-up with this fan-out.
    fn dispatch(&self, payload: &Payload) {
        let _delivery = self.delivery.lock();
        let Some(subscribers) = self
            .registry
            .prepare_delivery(&self.key, self.generation, payload)
        else {
            return;
        };

        let state = self.parser.load();
        for subscriber in subscribers {
            if subscriber.token.is_cancelled() {
                continue;
            }
            invoke(
                &subscriber.callback,
                &self.key,
                payload,
                &state,
                subscriber.id,
            );
        }
    }

    fn publish(&self, status: WatchStatus) {
        // No receivers is fine.
        let _ = self.health.send(status);
    }

    fn stopped(&self) {
        debug!(backend = self.watcher.kind(), key = %self.key, "Watch loop stopped");
        self.publish(WatchStatus::Stopped {
            key: self.key.clone(),
        });
    }
}

/// Run one callback, containing any panic it raises
pub(crate) fn invoke(
    callback: &Callback,
    key: &ConfigKey,
    payload: &Payload,
    state: &ParserState,
    subscriber: u64,
) {
    let notification = Notification {
        key,
        payload,
        parser: state.parser.as_ref(),
        config_type: state.config_type,
    };
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&notification))) {
        error!(
            key = %key,
            subscriber,
            panic = %panic_message(panic),
            "Config callback panicked"
        );
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
