//! Dynconf Client - config-center watch and callback subscription
//!
//! This crate provides:
//! - A generic [`ConfigClient`] delivering config changes to subscriber callbacks
//! - One shared backend watch per key, supervised and restarted with backoff
//! - Backends for Apollo, etcd, Consul and ZooKeeper, plus an in-memory store

pub mod apollo;
pub mod client;
pub mod consul;
pub mod error;
pub mod etcd;
pub mod memory;
pub mod registry;
pub mod watch_loop;
pub mod watcher;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

pub use client::{ClientOptions, ConfigClient};
pub use error::{ClientError, Result};
pub use registry::{CallbackRegistry, Deregistration};
pub use watch_loop::{RestartPolicy, WatchStatus};
pub use watcher::{Callback, Notification, PathLayout, Payload, Watcher};

// Backend re-exports
pub use apollo::{ApolloOptions, ApolloWatcher};
pub use consul::{ConsulOptions, ConsulWatcher};
pub use etcd::{EtcdOptions, EtcdWatcher};
pub use memory::MemoryWatcher;
#[cfg(feature = "zookeeper")]
pub use zookeeper::{ZookeeperOptions, ZookeeperWatcher};

pub type ApolloClient = ConfigClient<ApolloWatcher>;
pub type ConsulClient = ConfigClient<ConsulWatcher>;
pub type EtcdClient = ConfigClient<EtcdWatcher>;
pub type MemoryClient = ConfigClient<MemoryWatcher>;
#[cfg(feature = "zookeeper")]
pub type ZookeeperClient = ConfigClient<ZookeeperWatcher>;
