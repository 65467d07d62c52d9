//! Agent loop: subscribe a service's policies and hold them until shutdown

use dynconf_client::{ConfigClient, MemoryWatcher, Watcher, WatchStatus};
use dynconf_policy::{ClientPolicies, ClientSuite, ServerPolicies, ServerSuite};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BackendKind, Configuration};
use crate::startup::ShutdownSignal;

/// Live subscriptions of a running agent
pub struct Agent<W: Watcher> {
    client: ConfigClient<W>,
    client_policies: ClientPolicies,
    server_policies: ServerPolicies,
    health: JoinHandle<()>,
}

impl<W: Watcher> Agent<W> {
    /// Subscribe every policy of `service` (callee) as seen from `caller`
    pub async fn start(client: ConfigClient<W>, service: &str, caller: &str) -> anyhow::Result<Self> {
        let health = spawn_health_logger(&client);

        let client_policies = ClientSuite::new(service, caller, client.clone())
            .options()
            .await?;
        let server_policies = ServerSuite::new(service, client.clone()).options().await?;

        info!(
            backend = client.watcher().kind(),
            service,
            caller,
            keys = client.watched_keys().len(),
            "Policy subscriptions started"
        );
        Ok(Self {
            client,
            client_policies,
            server_policies,
            health,
        })
    }

    pub fn client(&self) -> &ConfigClient<W> {
        &self.client
    }

    pub fn client_policies(&self) -> &ClientPolicies {
        &self.client_policies
    }

    pub fn server_policies(&self) -> &ServerPolicies {
        &self.server_policies
    }

    /// Close every subscription and stop watching
    pub fn stop(self) {
        self.client_policies.close();
        self.server_policies.close();
        self.client.close();
        self.health.abort();
    }
}

fn spawn_health_logger<W: Watcher>(client: &ConfigClient<W>) -> JoinHandle<()> {
    let mut health = client.health();
    tokio::spawn(async move {
        loop {
            match health.recv().await {
                Ok(WatchStatus::Healthy { key }) => debug!(key = %key, "Watch healthy"),
                Ok(WatchStatus::Restarting {
                    key,
                    attempt,
                    reason,
                }) => warn!(key = %key, attempt, reason = %reason, "Watch restarting"),
                Ok(WatchStatus::Terminated { key, reason }) => {
                    error!(key = %key, reason = %reason, "Watch terminated, policy frozen")
                }
                Ok(WatchStatus::Stopped { key }) => debug!(key = %key, "Watch stopped"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Health events dropped"),
                Err(RecvError::Closed) => return,
            }
        }
    })
}

async fn serve<W: Watcher>(
    watcher: W,
    configuration: &Configuration,
    shutdown: &ShutdownSignal,
) -> anyhow::Result<()> {
    let client = ConfigClient::new(watcher, configuration.client_options()?);
    let agent = Agent::start(
        client,
        &configuration.service_name(),
        &configuration.client_name(),
    )
    .await?;

    shutdown.wait().await;
    agent.stop();
    info!("Agent stopped");
    Ok(())
}

/// Connect the configured backend and run until `shutdown` fires
pub async fn run(configuration: &Configuration, shutdown: &ShutdownSignal) -> anyhow::Result<()> {
    let backend = configuration.backend()?;
    info!(backend = %backend, "Starting dynconf agent");

    match backend {
        BackendKind::Apollo => {
            let watcher = dynconf_client::ApolloWatcher::new(configuration.apollo_options())?;
            serve(watcher, configuration, shutdown).await
        }
        BackendKind::Etcd => {
            let watcher = dynconf_client::EtcdWatcher::new(configuration.etcd_options())?;
            serve(watcher, configuration, shutdown).await
        }
        BackendKind::Consul => {
            let watcher = dynconf_client::ConsulWatcher::new(configuration.consul_options())?;
            serve(watcher, configuration, shutdown).await
        }
        #[cfg(feature = "zookeeper")]
        BackendKind::Zookeeper => {
            let watcher =
                dynconf_client::ZookeeperWatcher::connect(configuration.zookeeper_options())
                    .await?;
            serve(watcher, configuration, shutdown).await
        }
        #[cfg(not(feature = "zookeeper"))]
        BackendKind::Zookeeper => anyhow::bail!("built without ZooKeeper support"),
        BackendKind::Memory => serve(MemoryWatcher::new(), configuration, shutdown).await,
    }
}
