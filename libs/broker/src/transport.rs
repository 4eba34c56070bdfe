use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::{BrokerError, BrokerMessage};

/// A message addressed to one tenant as it travels between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub tenant: String,
    pub message: BrokerMessage,
}

pub type EnvelopeStream = BoxStream<'static, Envelope>;

/// Shared pub/sub channel every relay process publishes to and listens on.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BrokerError>;
    /// Opens a subscription to every tenant's traffic.
    async fn subscribe(&self) -> Result<EnvelopeStream, BrokerError>;
}

pub type SharedTransport = Arc<dyn BrokerTransport>;

const MEMORY_HUB_CAPACITY: usize = 1024;

/// In-process hub. Brokers built on clones of the same transport behave like separate
/// processes sharing one pub/sub server.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: broadcast::Sender<Envelope>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (hub, _) = broadcast::channel(MEMORY_HUB_CAPACITY);
        Self { hub }
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BrokerError> {
        // No listener anywhere is not an error for fire-and-forget delivery.
        let _ = self.hub.send(envelope.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<EnvelopeStream, BrokerError> {
        let mut rx = self.hub.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(envelope) => yield envelope,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "memory transport relay lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(feature = "redis-transport")]
pub use redis_transport::RedisTransport;

#[cfg(feature = "redis-transport")]
mod redis_transport {
    use anyhow::Context;
    use async_trait::async_trait;
    use futures::StreamExt;
    use redis::{AsyncCommands, aio::ConnectionManager};
    use tracing::warn;

    use super::{BrokerTransport, Envelope, EnvelopeStream};
    use crate::BrokerError;

    /// Redis pub/sub transport: one channel per tenant, one pattern subscription per process.
    pub struct RedisTransport {
        client: redis::Client,
        publisher: ConnectionManager,
        prefix: String,
    }

    impl RedisTransport {
        pub async fn connect(url: &str, prefix: impl Into<String>) -> anyhow::Result<Self> {
            let client = redis::Client::open(url)?;
            let publisher = ConnectionManager::new(client.clone()).await?;
            Ok(Self {
                client,
                publisher,
                prefix: prefix.into(),
            })
        }

        fn channel(&self, tenant: &str) -> String {
            format!("{}:tenant:{}", self.prefix, tenant)
        }
    }

    #[async_trait]
    impl BrokerTransport for RedisTransport {
        async fn publish(&self, envelope: &Envelope) -> Result<(), BrokerError> {
            let payload = serde_json::to_string(envelope)
                .map_err(|err| BrokerError::Transport(err.into()))?;
            let mut conn = self.publisher.clone();
            let _receivers: i64 = conn
                .publish(self.channel(&envelope.tenant), payload)
                .await
                .context("redis publish")?;
            Ok(())
        }

        async fn subscribe(&self) -> Result<EnvelopeStream, BrokerError> {
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .context("open redis pubsub")?;
            pubsub
                .psubscribe(format!("{}:tenant:*", self.prefix))
                .await
                .context("redis psubscribe")?;
            let stream = pubsub.into_on_message().filter_map(|msg| async move {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "dropping non-text pubsub payload");
                        return None;
                    }
                };
                match serde_json::from_str::<Envelope>(&payload) {
                    Ok(envelope) => Some(envelope),
                    Err(err) => {
                        warn!(error = %err, channel = msg.get_channel_name(), "dropping malformed envelope");
                        None
                    }
                }
            });
            Ok(Box::pin(stream))
        }
    }
}
