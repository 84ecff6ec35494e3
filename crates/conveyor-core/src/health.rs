//! Readiness probing with a bounded retry budget.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::Broker;
use crate::store::ResultStore;
use crate::topology::HealthCheck;
use crate::{Error, Result};

/// Something that can report whether a dependency is ready.
#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<()>;
}

pub struct BrokerProbe(pub Arc<dyn Broker>);

#[async_trait]
impl Probe for BrokerProbe {
    fn name(&self) -> &str {
        "broker"
    }

    async fn check(&self) -> Result<()> {
        self.0.ping().await
    }
}

pub struct StoreProbe(pub Arc<dyn ResultStore>);

#[async_trait]
impl Probe for StoreProbe {
    fn name(&self) -> &str {
        "store"
    }

    async fn check(&self) -> Result<()> {
        self.0.ping().await
    }
}

/// Runs `probe` until it passes or the check's budget is spent.
///
/// Waits `start_period` first, then makes up to `retries` attempts (at least
/// one), each bounded by `timeout` and separated by `interval`.
pub async fn wait_until_healthy(probe: &dyn Probe, check: &HealthCheck) -> Result<()> {
    retry_with_budget(probe.name(), check, || probe.check()).await
}

/// Same budget as [`wait_until_healthy`] for an operation that produces a
/// value, such as opening a connection to a server that may still be booting.
pub async fn retry_with_budget<T, F, Fut>(service: &str, check: &HealthCheck, mut attempt_fn: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if !check.start_period.is_zero() {
        tokio::time::sleep(check.start_period).await;
    }

    let attempts = check.retries.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match tokio::time::timeout(check.timeout, attempt_fn()).await {
            Ok(Ok(value)) => {
                tracing::info!(service, attempt, "Dependency healthy");
                return Ok(value);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("probe timed out after {:?}", check.timeout),
        }

        tracing::warn!(
            service,
            attempt,
            of = attempts,
            error = %last_error,
            "Dependency not ready"
        );

        if attempt < attempts {
            tokio::time::sleep(check.interval).await;
        }
    }

    Err(Error::Unhealthy {
        service: service.to_string(),
        attempts,
        last_error,
    })
}

/// Retry budget used when gating on infrastructure from inside a process.
pub fn startup_check(retries: u32, interval: Duration, timeout: Duration) -> HealthCheck {
    HealthCheck {
        test: Vec::new(),
        interval,
        timeout,
        retries,
        start_period: Duration::ZERO,
    }
}
