//! Configuration management for the dynconf agent
//!
//! Sources, lowest precedence first: `conf/dynconf.yml` (or `--config-file`),
//! `DYNCONF_*` environment variables (`__` separates nested keys, e.g.
//! `DYNCONF_ETCD__PREFIX`), then command line flags.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use config::{Config, ConfigBuilder, Environment, builder::DefaultState};
use dynconf_client::{
    ApolloOptions, ClientOptions, ConsulOptions, EtcdOptions, RestartPolicy,
};
use dynconf_common::ConfigType;

use crate::startup::{LogRotation, LoggingConfig};

pub const DEFAULT_CONFIG_FILE: &str = "conf/dynconf.yml";

/// Command line arguments
#[derive(Debug, Default, Parser)]
#[command(name = "dynconf", version, about = "Watch and apply service governance policies")]
pub struct Cli {
    /// Config center backend: apollo, etcd, consul, zookeeper or memory
    #[arg(short = 'b', long = "backend")]
    pub backend: Option<String>,
    /// Service whose policies are watched
    #[arg(short = 's', long = "service")]
    pub service: Option<String>,
    /// Caller service name used for client-side policies
    #[arg(long = "client")]
    pub client: Option<String>,
    #[arg(short = 'c', long = "config-file")]
    pub config_file: Option<String>,
}

/// Supported config center backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Apollo,
    Etcd,
    Consul,
    Zookeeper,
    Memory,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "apollo" => Ok(BackendKind::Apollo),
            "etcd" => Ok(BackendKind::Etcd),
            "consul" => Ok(BackendKind::Consul),
            "zookeeper" | "zk" => Ok(BackendKind::Zookeeper),
            "memory" => Ok(BackendKind::Memory),
            other => bail!("unknown backend '{}'", other),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Apollo => "apollo",
            BackendKind::Etcd => "etcd",
            BackendKind::Consul => "consul",
            BackendKind::Zookeeper => "zookeeper",
            BackendKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Agent configuration loaded from file, environment and flags
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    /// Load from the process arguments and environment
    pub fn new() -> anyhow::Result<Self> {
        let args = Cli::parse();
        let file = args
            .config_file
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
        let builder = Config::builder()
            .add_source(config::File::with_name(&file).required(args.config_file.is_some()))
            .add_source(
                Environment::with_prefix("DYNCONF")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("etcd.endpoints")
                    .with_list_parse_key("zookeeper.servers")
                    .try_parsing(true),
            );
        Self::build(builder, &args).with_context(|| format!("failed to load configuration from {}", file))
    }

    /// Load from a YAML document, applying `args` as overrides
    pub fn from_yaml(yaml: &str, args: &Cli) -> anyhow::Result<Self> {
        let builder =
            Config::builder().add_source(config::File::from_str(yaml, config::FileFormat::Yaml));
        Self::build(builder, args)
    }

    fn build(mut builder: ConfigBuilder<DefaultState>, args: &Cli) -> anyhow::Result<Self> {
        if let Some(v) = &args.backend {
            builder = builder.set_override("backend", v.as_str())?;
        }
        if let Some(v) = &args.service {
            builder = builder.set_override("service.name", v.as_str())?;
        }
        if let Some(v) = &args.client {
            builder = builder.set_override("service.client", v.as_str())?;
        }
        Ok(Configuration {
            config: builder.build()?,
        })
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.config
            .get_string(key)
            .unwrap_or_else(|_| default.to_string())
    }

    fn millis_or(&self, key: &str, default: Duration) -> Duration {
        self.config
            .get_int(key)
            .ok()
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    fn list_or(&self, key: &str, default: Vec<String>) -> Vec<String> {
        self.config
            .get::<Vec<String>>(key)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or(default)
    }

    // ========================================================================
    // Agent Configuration
    // ========================================================================

    pub fn backend(&self) -> anyhow::Result<BackendKind> {
        self.string_or("backend", "etcd").parse()
    }

    pub fn service_name(&self) -> String {
        self.string_or("service.name", "backend")
    }

    pub fn client_name(&self) -> String {
        self.string_or("service.client", "frontend")
    }

    pub fn config_type(&self) -> anyhow::Result<ConfigType> {
        Ok(self.string_or("config_type", "json").parse()?)
    }

    pub fn client_options(&self) -> anyhow::Result<ClientOptions> {
        let defaults = RestartPolicy::default();
        let restart = RestartPolicy {
            initial_backoff: self.millis_or("restart.initial_backoff_ms", defaults.initial_backoff),
            max_backoff: self.millis_or("restart.max_backoff_ms", defaults.max_backoff),
            max_restarts: self
                .config
                .get_int("restart.max_restarts")
                .ok()
                .and_then(|n| u32::try_from(n).ok()),
        };
        Ok(ClientOptions::default()
            .with_config_type(self.config_type()?)
            .with_fetch_timeout(self.millis_or("fetch_timeout_ms", Duration::from_secs(5)))
            .with_restart_policy(restart))
    }

    // ========================================================================
    // Backend Configuration
    // ========================================================================

    pub fn apollo_options(&self) -> ApolloOptions {
        let d = ApolloOptions::default();
        ApolloOptions {
            server_addr: self.string_or("apollo.server_addr", &d.server_addr),
            app_id: self.string_or("apollo.app_id", &d.app_id),
            cluster: self.string_or("apollo.cluster", &d.cluster),
            namespace_template: self.string_or("apollo.namespace_template", &d.namespace_template),
            client_key_template: self
                .string_or("apollo.client_key_template", &d.client_key_template),
            server_key_template: self
                .string_or("apollo.server_key_template", &d.server_key_template),
            connect_timeout: self.millis_or("apollo.connect_timeout_ms", d.connect_timeout),
            request_timeout: self.millis_or("apollo.request_timeout_ms", d.request_timeout),
            poll_timeout: self.millis_or("apollo.poll_timeout_ms", d.poll_timeout),
        }
    }

    pub fn etcd_options(&self) -> EtcdOptions {
        let d = EtcdOptions::default();
        EtcdOptions {
            endpoints: self.list_or("etcd.endpoints", d.endpoints.clone()),
            prefix: self.string_or("etcd.prefix", &d.prefix),
            client_path_template: self
                .string_or("etcd.client_path_template", &d.client_path_template),
            server_path_template: self
                .string_or("etcd.server_path_template", &d.server_path_template),
            connect_timeout: self.millis_or("etcd.connect_timeout_ms", d.connect_timeout),
            request_timeout: self.millis_or("etcd.request_timeout_ms", d.request_timeout),
        }
    }

    pub fn consul_options(&self) -> ConsulOptions {
        let d = ConsulOptions::default();
        ConsulOptions {
            addr: self.string_or("consul.addr", &d.addr),
            token: self.config.get_string("consul.token").ok().filter(|t| !t.is_empty()),
            datacenter: self
                .config
                .get_string("consul.datacenter")
                .ok()
                .filter(|dc| !dc.is_empty()),
            prefix: self.string_or("consul.prefix", &d.prefix),
            client_path_template: self
                .string_or("consul.client_path_template", &d.client_path_template),
            server_path_template: self
                .string_or("consul.server_path_template", &d.server_path_template),
            connect_timeout: self.millis_or("consul.connect_timeout_ms", d.connect_timeout),
            request_timeout: self.millis_or("consul.request_timeout_ms", d.request_timeout),
            wait: self.millis_or("consul.wait_ms", d.wait),
            min_query_interval: self
                .millis_or("consul.min_query_interval_ms", d.min_query_interval),
        }
    }

    #[cfg(feature = "zookeeper")]
    pub fn zookeeper_options(&self) -> dynconf_client::ZookeeperOptions {
        let d = dynconf_client::ZookeeperOptions::default();
        dynconf_client::ZookeeperOptions {
            servers: self.list_or("zookeeper.servers", d.servers.clone()),
            prefix: self.string_or("zookeeper.prefix", &d.prefix),
            client_path_template: self
                .string_or("zookeeper.client_path_template", &d.client_path_template),
            server_path_template: self
                .string_or("zookeeper.server_path_template", &d.server_path_template),
            connect_timeout: self.millis_or("zookeeper.connect_timeout_ms", d.connect_timeout),
        }
    }

    // ========================================================================
    // Logging Configuration
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        let d = LoggingConfig::default();
        let rotation = match self.string_or("log.rotation", "daily").as_str() {
            "hourly" => LogRotation::Hourly,
            "never" => LogRotation::Never,
            _ => LogRotation::Daily,
        };
        LoggingConfig {
            log_dir: self
                .config
                .get_string("log.dir")
                .map(PathBuf::from)
                .unwrap_or(d.log_dir),
            console_output: self.config.get_bool("log.console").unwrap_or(d.console_output),
            file_logging: self.config.get_bool("log.file").unwrap_or(d.file_logging),
            level: self.string_or("log.level", &d.level),
            rotation,
        }
    }
}
