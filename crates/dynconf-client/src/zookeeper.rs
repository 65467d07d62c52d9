//! ZooKeeper backend
//!
//! Node data is read with one-shot data watches that are re-armed after
//! every event. A missing node is watched through an existence watch so its
//! creation is observed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dynconf_common::{ConfigKey, ConfigParamConfig};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zookeeper_client as zk;

use crate::error::{ClientError, Result};
use crate::watcher::{PathLayout, Payload, Watcher, forward, forward_value, value_text};

/// Options for the ZooKeeper backend
#[derive(Debug, Clone)]
pub struct ZookeeperOptions {
    /// Ensemble members (e.g. ["127.0.0.1:2181"])
    pub servers: Vec<String>,
    pub prefix: String,
    pub client_path_template: String,
    pub server_path_template: String,
    pub connect_timeout: Duration,
}

impl Default for ZookeeperOptions {
    fn default() -> Self {
        Self {
            servers: vec!["127.0.0.1:2181".to_string()],
            prefix: "/KitexConfig".to_string(),
            client_path_template: "{{.ClientServiceName}}/{{.ServerServiceName}}/{{.Category}}"
                .to_string(),
            server_path_template: "{{.ServerServiceName}}/{{.Category}}".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ZookeeperOptions {
    fn layout(&self) -> Result<PathLayout> {
        PathLayout::new(
            &self.prefix,
            &self.client_path_template,
            &self.server_path_template,
        )
    }
}

struct Session {
    client: zk::Client,
    epoch: u64,
}

/// ZooKeeper watcher; the session is renewed after it expires
pub struct ZookeeperWatcher {
    options: ZookeeperOptions,
    layout: PathLayout,
    session: Mutex<Arc<Session>>,
}

impl ZookeeperWatcher {
    /// Connect to the ensemble
    pub async fn connect(options: ZookeeperOptions) -> Result<Self> {
        let layout = options.layout()?;
        let client = Self::open(&options).await?;
        Ok(Self {
            options,
            layout,
            session: Mutex::new(Arc::new(Session { client, epoch: 0 })),
        })
    }

    async fn open(options: &ZookeeperOptions) -> Result<zk::Client> {
        let servers = options.servers.join(",");
        let client = tokio::time::timeout(options.connect_timeout, zk::Client::connect(&servers))
            .await
            .map_err(|_| ClientError::Timeout)??;
        info!(servers = %servers, "Connected to ZooKeeper");
        Ok(client)
    }

    async fn session(&self) -> Arc<Session> {
        self.session.lock().await.clone()
    }

    /// Replace the session of `expired_epoch` unless another watch already did.
    async fn renew(&self, expired_epoch: u64) {
        let mut current = self.session.lock().await;
        if current.epoch != expired_epoch {
            return;
        }
        match Self::open(&self.options).await {
            Ok(client) => {
                *current = Arc::new(Session {
                    client,
                    epoch: expired_epoch + 1,
                });
            }
            Err(e) => warn!(error = %e, "Failed to renew ZooKeeper session"),
        }
    }

    async fn expired(&self, session: &Session) -> ClientError {
        self.renew(session.epoch).await;
        ClientError::SessionExpired
    }
}

fn is_session_loss(error: &zk::Error) -> bool {
    matches!(error, zk::Error::SessionExpired | zk::Error::ClientClosed)
}

/// Payload of a node read; a missing node is [`Payload::Absent`]
fn node_payload(path: &str, read: std::result::Result<Vec<u8>, zk::Error>) -> Result<Payload> {
    match read {
        Ok(data) => value_text(path, data).map(Payload::Data),
        Err(zk::Error::NoNode) => Ok(Payload::Absent),
        Err(e) => Err(e.into()),
    }
}

/// What a fired watch means for the watch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchOutcome {
    /// Read the node again and re-arm
    Rearm,
    /// The session is gone; renew it and fail the watch
    SessionLost,
    /// Terminal authentication failure
    AuthFailed,
}

fn watch_outcome(event_type: zk::EventType, state: zk::SessionState) -> WatchOutcome {
    if event_type != zk::EventType::Session {
        return WatchOutcome::Rearm;
    }
    match state {
        zk::SessionState::Expired | zk::SessionState::Closed => WatchOutcome::SessionLost,
        zk::SessionState::AuthFailed => WatchOutcome::AuthFailed,
        _ => WatchOutcome::Rearm,
    }
}

#[async_trait]
impl Watcher for ZookeeperWatcher {
    fn kind(&self) -> &'static str {
        "zookeeper"
    }

    fn client_key(&self, param: &ConfigParamConfig) -> Result<ConfigKey> {
        self.layout.client_key(param)
    }

    fn server_key(&self, param: &ConfigParamConfig) -> Result<ConfigKey> {
        self.layout.server_key(param)
    }

    async fn fetch(&self, key: &ConfigKey) -> Result<Payload> {
        let session = self.session().await;
        match session.client.get_data(&key.key).await {
            Err(e) if is_session_loss(&e) => Err(self.expired(&session).await),
            read => node_payload(&key.key, read.map(|(data, _)| data)),
        }
    }

    async fn watch(
        &self,
        key: &ConfigKey,
        tx: mpsc::Sender<Payload>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let session = self.session().await;
        let path = key.key.as_str();

        loop {
            let watcher = match session.client.get_and_watch_data(path).await {
                Ok((data, _, watcher)) => {
                    if !forward_value(&tx, key, node_payload(path, Ok(data))).await {
                        return Ok(());
                    }
                    watcher
                }
                Err(zk::Error::NoNode) => match session.client.check_and_watch_stat(path).await {
                    // Created between the two calls; read it again
                    Ok((Some(_), _)) => continue,
                    Ok((None, watcher)) => {
                        if !forward(&tx, Payload::Absent).await {
                            return Ok(());
                        }
                        watcher
                    }
                    Err(e) if is_session_loss(&e) => return Err(self.expired(&session).await),
                    Err(e) => return Err(e.into()),
                },
                Err(e) if is_session_loss(&e) => return Err(self.expired(&session).await),
                Err(e) => return Err(e.into()),
            };

            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = watcher.changed() => event,
            };
            debug!(key = %key, event = ?event.event_type, state = ?event.session_state, "ZooKeeper watch fired");

            match watch_outcome(event.event_type, event.session_state) {
                WatchOutcome::Rearm => {}
                WatchOutcome::SessionLost => return Err(self.expired(&session).await),
                WatchOutcome::AuthFailed => {
                    return Err(ClientError::WatchClosed(
                        "zookeeper authentication failed".to_string(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = ZookeeperOptions::default();
        assert_eq!(options.servers, vec!["127.0.0.1:2181".to_string()]);
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_key_layout() {
        let layout = ZookeeperOptions::default().layout().unwrap();
        let param = ConfigParamConfig::new("circuit_break", "frontend", "backend");
        assert_eq!(
            layout.client_key(&param).unwrap(),
            ConfigKey::path("/KitexConfig/frontend/backend/circuit_break")
        );
        assert_eq!(
            layout.server_key(&param).unwrap(),
            ConfigKey::path("/KitexConfig/backend/circuit_break")
        );

        let options = ZookeeperOptions {
            server_path_template: "{{.Service}}".to_string(),
            ..Default::default()
        };
        assert!(options.layout().is_err());
    }

    #[test]
    fn test_session_loss_classification() {
        assert!(is_session_loss(&zk::Error::SessionExpired));
        assert!(is_session_loss(&zk::Error::ClientClosed));
        assert!(!is_session_loss(&zk::Error::NoNode));
        assert!(!is_session_loss(&zk::Error::NoAuth));
    }

    #[test]
    fn test_node_payload() {
        assert_eq!(
            node_payload("/a", Ok(b"v1".to_vec())).unwrap(),
            Payload::Data("v1".to_string())
        );
        assert_eq!(node_payload("/a", Err(zk::Error::NoNode)).unwrap(), Payload::Absent);
        assert!(matches!(
            node_payload("/a", Ok(vec![0xff, 0xfe])),
            Err(ClientError::InvalidValue { key, .. }) if key == "/a"
        ));
        assert!(matches!(
            node_payload("/a", Err(zk::Error::NoAuth)),
            Err(ClientError::ZooKeeper(zk::Error::NoAuth))
        ));
    }

    #[test]
    fn test_watch_outcome() {
        use zk::{EventType, SessionState};

        assert_eq!(
            watch_outcome(EventType::NodeDataChanged, SessionState::SyncConnected),
            WatchOutcome::Rearm
        );
        assert_eq!(
            watch_outcome(EventType::NodeDeleted, SessionState::SyncConnected),
            WatchOutcome::Rearm
        );
        assert_eq!(
            watch_outcome(EventType::Session, SessionState::Disconnected),
            WatchOutcome::Rearm
        );
        assert_eq!(
            watch_outcome(EventType::Session, SessionState::Expired),
            WatchOutcome::SessionLost
        );
        assert_eq!(
            watch_outcome(EventType::Session, SessionState::Closed),
            WatchOutcome::SessionLost
        );
        assert_eq!(
            watch_outcome(EventType::Session, SessionState::AuthFailed),
            WatchOutcome::AuthFailed
        );
    }
}
