//! dynconf Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all dynconf components:
//! - Error types
//! - Config keys and key templates
//! - Pluggable payload parsing
//! - The method diff set used by policy consumers
//! - Subscriber id allocation

pub mod error;
pub mod id;
pub mod key;
pub mod parser;
pub mod set;

// Re-exports for convenience
pub use error::{DynconfError, Result};
pub use id::{SubscriberId, SubscriberIds};
pub use key::{ConfigKey, ConfigParamConfig, KeyTemplate};
pub use parser::{ConfigParser, ConfigType, DefaultParser, decode};
pub use set::ThreadSafeSet;

/// Wildcard method name matching any method in per-method policy payloads
pub const WILDCARD_METHOD: &str = "*";

/// Policy categories used when rendering config keys
pub const CATEGORY_RETRY: &str = "retry";
pub const CATEGORY_RPC_TIMEOUT: &str = "rpc_timeout";
pub const CATEGORY_CIRCUIT_BREAK: &str = "circuit_break";
pub const CATEGORY_LIMIT: &str = "limit";
pub const CATEGORY_DEGRADATION: &str = "degradation";
