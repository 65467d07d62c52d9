//! Dynconf Client Subscription Tests
//!
//! Exercise registration, fan-out and watch supervision against the
//! in-memory backend and scripted test watchers. No live server needed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dynconf_client::{
    ClientError, ClientOptions, ConfigClient, MemoryWatcher, Notification, Payload, RestartPolicy,
    WatchStatus, Watcher,
};
use dynconf_common::{ConfigKey, ConfigParamConfig, ConfigParser, ConfigType, DynconfError};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

type Seen = Arc<Mutex<Vec<Option<String>>>>;

fn recorder(seen: &Seen) -> impl Fn(&Notification<'_>) + Send + Sync + 'static {
    let seen = seen.clone();
    move |n: &Notification<'_>| seen.lock().push(n.payload.data().map(str::to_string))
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn next_status(rx: &mut broadcast::Receiver<WatchStatus>) -> WatchStatus {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("health event")
        .expect("health channel open")
}

fn fast_restart() -> RestartPolicy {
    RestartPolicy {
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        max_restarts: None,
    }
}

fn data(value: &str) -> Option<String> {
    Some(value.to_string())
}

// ============== Registration and Fan-out ==============

#[tokio::test]
async fn test_register_and_deregister() {
    let client = ConfigClient::new(MemoryWatcher::new(), ClientOptions::default());
    let key = ConfigKey::path("/KitexConfig/frontend/backend/retry");

    let first: Seen = Arc::default();
    let second: Seen = Arc::default();
    client.register_config_callback(&key, 1, recorder(&first)).await;
    client.register_config_callback(&key, 2, recorder(&second)).await;
    assert_eq!(client.subscriber_count(&key), 2);

    // Both see the initial absent value exactly once
    assert_eq!(*first.lock(), vec![None]);
    assert_eq!(*second.lock(), vec![None]);

    client.watcher().put(&key, "first change");
    eventually("both subscribers see first change", || {
        first.lock().len() == 2 && second.lock().len() == 2
    })
    .await;
    assert_eq!(first.lock()[1], data("first change"));
    assert_eq!(second.lock()[1], data("first change"));

    client.deregister_config(&key, 2);
    client.watcher().put(&key, "second change");
    eventually("subscriber 1 sees second change", || first.lock().len() == 3).await;
    assert_eq!(first.lock()[2], data("second change"));

    client.deregister_config(&key, 1);
    assert!(client.watched_keys().is_empty());
    client.watcher().put(&key, "third change");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(first.lock().len(), 3);
    assert_eq!(second.lock().len(), 2);
}

#[tokio::test]
async fn test_deregister_unknown_is_noop() {
    let client = ConfigClient::new(MemoryWatcher::new(), ClientOptions::default());
    let key = ConfigKey::path("/a");
    client.deregister_config(&key, 42);

    let seen: Seen = Arc::default();
    client.register_config_callback(&key, 1, recorder(&seen)).await;
    client.deregister_config(&key, 2);
    client.deregister_config(&ConfigKey::path("/b"), 1);
    assert_eq!(client.subscriber_count(&key), 1);
}

#[tokio::test]
async fn test_reregister_overwrites() {
    let client = ConfigClient::new(MemoryWatcher::new(), ClientOptions::default());
    let key = ConfigKey::path("/a");

    let old: Seen = Arc::default();
    let new: Seen = Arc::default();
    client.register_config_callback(&key, 7, recorder(&old)).await;
    client.register_config_callback(&key, 7, recorder(&new)).await;
    assert_eq!(client.subscriber_count(&key), 1);

    client.watcher().put(&key, "v1");
    eventually("replacement callback sees v1", || new.lock().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*old.lock(), vec![None]);
    assert_eq!(*new.lock(), vec![None, data("v1")]);
}

#[tokio::test]
async fn test_initial_value_delivered_once() {
    let store = MemoryWatcher::new();
    let key = ConfigKey::path("/a");
    store.put(&key, "v1");
    let client = ConfigClient::new(store, ClientOptions::default());

    let seen: Seen = Arc::default();
    client.register_config_callback(&key, 1, recorder(&seen)).await;
    assert_eq!(*seen.lock(), vec![data("v1")]);

    // The watch re-reads v1 when it starts; that must not be re-delivered
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*seen.lock(), vec![data("v1")]);
}

/// Memory store whose second fetch returns the value read before a
/// concurrent change landed.
struct LaggingFetch {
    store: MemoryWatcher,
    fetches: AtomicU32,
}

#[async_trait]
impl Watcher for LaggingFetch {
    fn kind(&self) -> &'static str {
        "lagging"
    }

    fn client_key(&self, param: &ConfigParamConfig) -> dynconf_client::Result<ConfigKey> {
        self.store.client_key(param)
    }

    fn server_key(&self, param: &ConfigParamConfig) -> dynconf_client::Result<ConfigKey> {
        self.store.server_key(param)
    }

    async fn fetch(&self, key: &ConfigKey) -> dynconf_client::Result<Payload> {
        let read = self.store.fetch(key).await?;
        if self.fetches.fetch_add(1, Ordering::SeqCst) == 1 {
            self.store.put(key, "v2");
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(read)
    }

    async fn watch(
        &self,
        key: &ConfigKey,
        tx: mpsc::Sender<Payload>,
        cancel: CancellationToken,
    ) -> dynconf_client::Result<()> {
        self.store.watch(key, tx, cancel).await
    }
}

#[tokio::test]
async fn test_joining_subscriber_catches_up_with_change_during_fetch() {
    let store = MemoryWatcher::new();
    let key = ConfigKey::path("/a");
    store.put(&key, "v1");
    let client = ConfigClient::new(
        LaggingFetch {
            store,
            fetches: AtomicU32::new(0),
        },
        ClientOptions::default(),
    );

    let first: Seen = Arc::default();
    client.register_config_callback(&key, 1, recorder(&first)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second: Seen = Arc::default();
    client.register_config_callback(&key, 2, recorder(&second)).await;
    assert_eq!(*second.lock(), vec![data("v1"), data("v2")]);

    eventually("first subscriber sees v2", || first.lock().len() == 2).await;
    assert_eq!(*first.lock(), vec![data("v1"), data("v2")]);

    // Nothing is delivered twice once both are current
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(second.lock().len(), 2);
}

#[tokio::test]
async fn test_callback_panic_is_contained() {
    let client = ConfigClient::new(MemoryWatcher::new(), ClientOptions::default());
    let key = ConfigKey::path("/a");

    client
        .register_config_callback(&key, 1, |n: &Notification<'_>| {
            if n.payload.data() == Some("boom") {
                panic!("callback exploded");
            }
        })
        .await;
    let seen: Seen = Arc::default();
    client.register_config_callback(&key, 2, recorder(&seen)).await;

    client.watcher().put(&key, "boom");
    eventually("second subscriber sees boom", || seen.lock().len() == 2).await;

    client.watcher().put(&key, "after");
    eventually("watch survives the panic", || seen.lock().len() == 3).await;
    assert_eq!(seen.lock()[2], data("after"));
}

#[tokio::test]
async fn test_clients_allocate_ids_independently() {
    let a = ConfigClient::new(MemoryWatcher::new(), ClientOptions::default());
    let b = ConfigClient::new(MemoryWatcher::new(), ClientOptions::default());
    assert_eq!(a.next_subscriber_id(), 1);
    assert_eq!(a.next_subscriber_id(), 2);
    assert_eq!(b.next_subscriber_id(), 1);
}

#[tokio::test]
async fn test_config_params_render_keys() {
    let client = ConfigClient::new(MemoryWatcher::new(), ClientOptions::default());
    let param = ConfigParamConfig::new("circuit_break", "frontend", "backend");

    assert_eq!(
        client.client_config_param(&param).unwrap(),
        ConfigKey::path("/KitexConfig/frontend/backend/circuit_break")
    );
    assert_eq!(
        client.server_config_param(&param).unwrap(),
        ConfigKey::path("/KitexConfig/backend/circuit_break")
    );
}

// ============== Decoding ==============

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
struct Degradation {
    #[serde(default)]
    enable: bool,
    #[serde(default)]
    percentage: i32,
}

#[tokio::test]
async fn test_end_to_end_decode_and_restore_default() {
    let client = ConfigClient::new(MemoryWatcher::new(), ClientOptions::default());
    let key = ConfigKey::new("n1", "c1", "k1");
    assert_eq!(key.to_string(), "n1/c1/k1");

    let applied: Arc<Mutex<Vec<HashMap<String, Degradation>>>> = Arc::default();
    let sink = applied.clone();
    client
        .register_config_callback(&key, 1, move |n: &Notification<'_>| {
            match n.decode::<HashMap<String, Degradation>>() {
                Ok(Some(config)) => sink.lock().push(config),
                Ok(None) => sink.lock().push(HashMap::from([(
                    "Echo".to_string(),
                    Degradation::default(),
                )])),
                Err(_) => {}
            }
        })
        .await;
    assert!(!applied.lock()[0]["Echo"].enable);

    client
        .watcher()
        .put(&key, r#"{"Echo": {"enable": true, "percentage": 50}}"#);
    eventually("decoded config applied", || applied.lock().len() == 2).await;
    assert_eq!(
        applied.lock()[1]["Echo"],
        Degradation {
            enable: true,
            percentage: 50
        }
    );

    client.watcher().delete(&key);
    eventually("default restored", || applied.lock().len() == 3).await;
    assert!(!applied.lock()[2]["Echo"].enable);
}

struct UpperParser;

impl ConfigParser for UpperParser {
    fn decode(&self, _kind: ConfigType, data: &str) -> Result<serde_json::Value, DynconfError> {
        Ok(serde_json::Value::String(data.to_uppercase()))
    }
}

#[tokio::test]
async fn test_set_parser_applies_to_later_notifications() {
    let client = ConfigClient::new(MemoryWatcher::new(), ClientOptions::default());
    let key = ConfigKey::path("/a");

    let decoded: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = decoded.clone();
    client
        .register_config_callback(&key, 1, move |n: &Notification<'_>| {
            if let Ok(Some(value)) = n.decode::<String>() {
                sink.lock().push(value);
            }
        })
        .await;

    client.set_parser(UpperParser);
    client.watcher().put(&key, "quiet");
    eventually("custom parser used", || decoded.lock().len() == 1).await;
    assert_eq!(decoded.lock()[0], "QUIET");
}

// ============== Watch Supervision ==============

/// Fails, then panics, then serves a value until cancelled
struct FlakyWatcher {
    attempts: AtomicU32,
}

#[async_trait]
impl Watcher for FlakyWatcher {
    fn kind(&self) -> &'static str {
        "flaky"
    }

    fn client_key(&self, _param: &ConfigParamConfig) -> dynconf_client::Result<ConfigKey> {
        Ok(ConfigKey::path("/flaky"))
    }

    fn server_key(&self, _param: &ConfigParamConfig) -> dynconf_client::Result<ConfigKey> {
        Ok(ConfigKey::path("/flaky"))
    }

    async fn fetch(&self, _key: &ConfigKey) -> dynconf_client::Result<Payload> {
        Ok(Payload::Absent)
    }

    async fn watch(
        &self,
        _key: &ConfigKey,
        tx: mpsc::Sender<Payload>,
        cancel: CancellationToken,
    ) -> dynconf_client::Result<()> {
        match self.attempts.fetch_add(1, Ordering::SeqCst) {
            0 => Err(ClientError::WatchClosed("reset by peer".to_string())),
            1 => panic!("watch exploded"),
            _ => {
                let _ = tx.send(Payload::Data("recovered".to_string())).await;
                cancel.cancelled().await;
                Ok(())
            }
        }
    }
}

#[tokio::test]
async fn test_failed_watch_is_restarted() {
    let watcher = FlakyWatcher {
        attempts: AtomicU32::new(0),
    };
    let client = ConfigClient::new(
        watcher,
        ClientOptions::default().with_restart_policy(fast_restart()),
    );
    let mut health = client.health();
    let key = ConfigKey::path("/flaky");

    let seen: Seen = Arc::default();
    client.register_config_callback(&key, 1, recorder(&seen)).await;

    match next_status(&mut health).await {
        WatchStatus::Restarting { attempt, reason, .. } => {
            assert_eq!(attempt, 1);
            assert!(reason.contains("reset by peer"));
        }
        other => panic!("unexpected status {:?}", other),
    }
    match next_status(&mut health).await {
        WatchStatus::Restarting { attempt, reason, .. } => {
            assert_eq!(attempt, 2);
            assert!(reason.starts_with("panic"));
        }
        other => panic!("unexpected status {:?}", other),
    }
    assert_eq!(
        next_status(&mut health).await,
        WatchStatus::Healthy { key: key.clone() }
    );
    eventually("recovered value delivered", || seen.lock().len() == 2).await;
    assert_eq!(seen.lock()[1], data("recovered"));

    client.deregister_config(&key, 1);
    assert_eq!(next_status(&mut health).await, WatchStatus::Stopped { key });
}

/// Every watch attempt fails
struct BrokenWatcher;

#[async_trait]
impl Watcher for BrokenWatcher {
    fn kind(&self) -> &'static str {
        "broken"
    }

    fn client_key(&self, _param: &ConfigParamConfig) -> dynconf_client::Result<ConfigKey> {
        Ok(ConfigKey::path("/broken"))
    }

    fn server_key(&self, _param: &ConfigParamConfig) -> dynconf_client::Result<ConfigKey> {
        Ok(ConfigKey::path("/broken"))
    }

    async fn fetch(&self, _key: &ConfigKey) -> dynconf_client::Result<Payload> {
        Err(ClientError::Timeout)
    }

    async fn watch(
        &self,
        _key: &ConfigKey,
        _tx: mpsc::Sender<Payload>,
        _cancel: CancellationToken,
    ) -> dynconf_client::Result<()> {
        Err(ClientError::SessionExpired)
    }
}

#[tokio::test]
async fn test_restart_limit_terminates_watch() {
    let restart = RestartPolicy {
        max_restarts: Some(1),
        ..fast_restart()
    };
    let client = ConfigClient::new(
        BrokenWatcher,
        ClientOptions::default().with_restart_policy(restart),
    );
    let mut health = client.health();
    let key = ConfigKey::path("/broken");

    let seen: Seen = Arc::default();
    client.register_config_callback(&key, 1, recorder(&seen)).await;
    // Failed initial fetch: nothing delivered, registration still made
    assert!(seen.lock().is_empty());
    assert_eq!(client.subscriber_count(&key), 1);

    assert!(matches!(
        next_status(&mut health).await,
        WatchStatus::Restarting { attempt: 1, .. }
    ));
    match next_status(&mut health).await {
        WatchStatus::Terminated { reason, .. } => assert_eq!(reason, "session expired"),
        other => panic!("unexpected status {:?}", other),
    }
}

#[tokio::test]
async fn test_close_stops_every_watch() {
    let client = ConfigClient::new(MemoryWatcher::new(), ClientOptions::default());
    let mut health = client.health();
    let a = ConfigKey::path("/a");
    let b = ConfigKey::path("/b");

    let seen: Seen = Arc::default();
    client.register_config_callback(&a, 1, recorder(&seen)).await;
    client.register_config_callback(&b, 2, recorder(&seen)).await;
    assert_eq!(client.watched_keys().len(), 2);

    client.close();
    assert!(client.watched_keys().is_empty());

    let mut stopped = 0;
    while stopped < 2 {
        if let WatchStatus::Stopped { .. } = next_status(&mut health).await {
            stopped += 1;
        }
    }

    client.watcher().put(&a, "late");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().len(), 2);
}
