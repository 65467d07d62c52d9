//! Client and server policy suites
//!
//! A suite subscribes every policy container of one side of a call path
//! and closes them together.

use dynconf_client::{ConfigClient, Result, Watcher};

use crate::circuit_breaker::{CircuitBreakerContainer, with_circuit_breaker};
use crate::degradation::{DegradationContainer, with_degradation};
use crate::limiter::{LimiterContainer, with_limiter};
use crate::retry::{RetryContainer, with_retry_policy};
use crate::subscription::PolicySubscription;
use crate::timeout::{TimeoutContainer, with_rpc_timeout};

/// Client-side policies of `src -> dest`
pub struct ClientSuite<W: Watcher> {
    dest: String,
    src: String,
    client: ConfigClient<W>,
}

impl<W: Watcher> ClientSuite<W> {
    pub fn new(dest: impl Into<String>, src: impl Into<String>, client: ConfigClient<W>) -> Self {
        Self {
            dest: dest.into(),
            src: src.into(),
            client,
        }
    }

    /// Subscribe retry, timeout, circuit breaker and degradation policies.
    ///
    /// On failure the subscriptions already made are closed again.
    pub async fn options(&self) -> Result<ClientPolicies> {
        let (dest, src) = (self.dest.as_str(), self.src.as_str());

        let retry = with_retry_policy(dest, src, &self.client).await?;
        let timeout = match with_rpc_timeout(dest, src, &self.client).await {
            Ok(timeout) => timeout,
            Err(e) => {
                retry.close();
                return Err(e);
            }
        };
        let circuit_breaker = match with_circuit_breaker(dest, src, &self.client).await {
            Ok(circuit_breaker) => circuit_breaker,
            Err(e) => {
                retry.close();
                timeout.close();
                return Err(e);
            }
        };
        let degradation = match with_degradation(dest, src, &self.client).await {
            Ok(degradation) => degradation,
            Err(e) => {
                retry.close();
                timeout.close();
                circuit_breaker.close();
                return Err(e);
            }
        };

        Ok(ClientPolicies {
            retry,
            timeout,
            circuit_breaker,
            degradation,
        })
    }
}

#[derive(Debug)]
pub struct ClientPolicies {
    pub retry: PolicySubscription<RetryContainer>,
    pub timeout: PolicySubscription<TimeoutContainer>,
    pub circuit_breaker: PolicySubscription<CircuitBreakerContainer>,
    pub degradation: PolicySubscription<DegradationContainer>,
}

impl ClientPolicies {
    pub fn close(self) {
        self.retry.close();
        self.timeout.close();
        self.circuit_breaker.close();
        self.degradation.close();
    }
}

/// Server-side policies of `service`
pub struct ServerSuite<W: Watcher> {
    service: String,
    client: ConfigClient<W>,
}

impl<W: Watcher> ServerSuite<W> {
    pub fn new(service: impl Into<String>, client: ConfigClient<W>) -> Self {
        Self {
            service: service.into(),
            client,
        }
    }

    pub async fn options(&self) -> Result<ServerPolicies> {
        Ok(ServerPolicies {
            limiter: with_limiter(&self.service, &self.client).await?,
        })
    }
}

#[derive(Debug)]
pub struct ServerPolicies {
    pub limiter: PolicySubscription<LimiterContainer>,
}

impl ServerPolicies {
    pub fn close(self) {
        self.limiter.close();
    }
}
