//! Redis-backed broker and result store.

pub mod broker;
pub mod error;
pub mod keys;
pub mod store;

use std::sync::Arc;

use conveyor_core::config::{BrokerBackend, Settings};
use conveyor_core::health::{retry_with_budget, wait_until_healthy, BrokerProbe, StoreProbe};
use conveyor_core::{Broker, MemoryBroker, MemoryStore, ResultStore};

// Re-exports
pub use broker::RedisBroker;
pub use error::{Error, Result};
pub use store::RedisStore;

pub fn client(redis_url: &str) -> Result<redis::Client> {
    redis::Client::open(redis_url).map_err(|e| Error::Connection(e.to_string()))
}

/// Opens a managed connection that reconnects on its own.
pub async fn connect(redis_url: &str) -> Result<redis::aio::ConnectionManager> {
    redis::aio::ConnectionManager::new(client(redis_url)?)
        .await
        .map_err(|e| Error::Connection(e.to_string()))
}

/// Broker and result store selected by the settings.
#[derive(Clone)]
pub struct Backends {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn ResultStore>,
}

impl Backends {
    /// `consumer` names this process's in-flight list on the Redis broker.
    pub async fn open(settings: &Settings, consumer: &str) -> Result<Self> {
        match settings.broker.backend {
            BrokerBackend::Redis => {
                let broker =
                    RedisBroker::connect(&settings.broker_url(), &settings.broker.queue, consumer)
                        .await?;
                let store =
                    RedisStore::connect(&settings.redis.url(), settings.results.ttl()).await?;
                tracing::info!(queue = %settings.broker.queue, consumer, "Connected to Redis");
                Ok(Self {
                    broker: Arc::new(broker),
                    store: Arc::new(store),
                })
            }
            BrokerBackend::Memory => {
                tracing::warn!("Using the in-process broker; tasks do not leave this process");
                Ok(Self::in_memory(settings))
            }
        }
    }

    /// [`Backends::open`] under the startup retry budget, then waits for
    /// both servers to answer PING.
    pub async fn open_when_ready(
        settings: &Settings,
        consumer: &str,
    ) -> conveyor_core::Result<Self> {
        let check = settings.startup.health_check();
        let backends = retry_with_budget("redis", &check, move || async move {
            Self::open(settings, consumer)
                .await
                .map_err(conveyor_core::Error::from)
        })
        .await?;

        wait_until_healthy(&BrokerProbe(Arc::clone(&backends.broker)), &check).await?;
        wait_until_healthy(&StoreProbe(Arc::clone(&backends.store)), &check).await?;
        Ok(backends)
    }

    pub fn in_memory(settings: &Settings) -> Self {
        Self {
            broker: Arc::new(MemoryBroker::new(settings.broker.queue.clone())),
            store: Arc::new(MemoryStore::with_result_ttl(settings.results.ttl())),
        }
    }
}
