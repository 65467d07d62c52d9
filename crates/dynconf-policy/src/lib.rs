//! Dynconf Policy - governance policy containers driven by config updates
//!
//! Each builder renders the policy's config key, subscribes a container to
//! it and returns a [`PolicySubscription`] whose close callback removes the
//! subscription again:
//! - retry, RPC timeout, circuit breaker and degradation on the client side
//! - connection and QPS limits on the server side

pub mod circuit_breaker;
pub mod degradation;
pub mod limiter;
pub mod retry;
pub mod subscription;
pub mod suite;
pub mod timeout;

pub use circuit_breaker::{CbConfig, CircuitBreakerContainer, with_circuit_breaker};
pub use degradation::{DegradationConfig, DegradationContainer, with_degradation};
pub use limiter::{LimiterConfig, LimiterContainer, with_limiter};
pub use retry::{
    BackoffPolicy, BackoffType, BackupPolicy, CbPolicy, FailurePolicy, RetryContainer,
    RetryPolicy, RetryType, StopPolicy, with_retry_policy,
};
pub use subscription::{CloseCallback, PolicyConsumer, PolicySubscription};
pub use suite::{ClientPolicies, ClientSuite, ServerPolicies, ServerSuite};
pub use timeout::{RpcTimeout, TimeoutContainer, with_rpc_timeout};
