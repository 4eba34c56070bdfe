//! Per-tenant fan-out of stream events.
//!
//! Each process keeps a local registry of tenant queues. Publishing always goes through
//! the shared [`BrokerTransport`]; a single relay task per process takes deliveries off the
//! transport and pushes them into the local queues. Queues are bounded and drop their
//! oldest entries when a subscriber falls behind, so publishers never wait on consumers.
//!
//! When the transport subscription ends, every local queue is closed and the relay
//! resubscribes with exponential backoff. New subscribers are refused until it is back.

mod transport;

use std::{
    sync::{
        Arc, Mutex as StdMutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub use transport::{BrokerTransport, Envelope, EnvelopeStream, MemoryTransport, SharedTransport};
#[cfg(feature = "redis-transport")]
pub use transport::RedisTransport;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

const RESUBSCRIBE_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker is closed")]
    Closed,
    #[error("broker transport is reconnecting")]
    Offline,
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// One event as seen by a stream consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub data: Value,
}

impl BrokerMessage {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            id: None,
            data,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    pub subscriber_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

type TenantQueue = Arc<broadcast::Sender<BrokerMessage>>;
type Registry = Arc<DashMap<String, TenantQueue>>;

#[derive(Clone)]
pub struct EventBroker {
    inner: Arc<Inner>,
}

struct Inner {
    transport: SharedTransport,
    registry: Registry,
    buffer: usize,
    closed: AtomicBool,
    online: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    relay: StdMutex<Option<JoinHandle<()>>>,
}

impl EventBroker {
    /// Opens the shared subscription and spawns this process's relay task.
    pub async fn start(transport: SharedTransport, config: BrokerConfig) -> Result<Self, BrokerError> {
        let stream = transport.subscribe().await?;
        let registry: Registry = Arc::new(DashMap::new());
        let online = Arc::new(AtomicBool::new(true));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let relay = tokio::spawn(run_relay(
            transport.clone(),
            stream,
            registry.clone(),
            online.clone(),
            shutdown_rx,
        ));
        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                registry,
                buffer: config.subscriber_buffer.max(1),
                closed: AtomicBool::new(false),
                online,
                shutdown,
                relay: StdMutex::new(Some(relay)),
            }),
        })
    }

    pub async fn memory() -> Result<Self, BrokerError> {
        Self::start(Arc::new(MemoryTransport::new()), BrokerConfig::default()).await
    }

    /// Registers a local subscriber for `tenant`. Dropping the subscription unregisters it.
    pub fn subscribe(&self, tenant: &str) -> Result<Subscription, BrokerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        if !self.is_online() {
            return Err(BrokerError::Offline);
        }
        let queue = self
            .inner
            .registry
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(broadcast::channel(self.inner.buffer).0))
            .clone();
        let receiver = queue.subscribe();
        debug!(tenant, clients = queue.receiver_count(), "stream subscriber registered");
        Ok(Subscription {
            tenant: tenant.to_string(),
            receiver,
            queue: Arc::downgrade(&queue),
            registry: self.inner.registry.clone(),
            dropped: 0,
        })
    }

    /// Fire-and-forget publish through the shared transport. No retry, no local fallback.
    pub async fn publish(&self, tenant: &str, message: BrokerMessage) -> Result<(), BrokerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let envelope = Envelope {
            tenant: tenant.to_string(),
            message,
        };
        self.inner.transport.publish(&envelope).await
    }

    pub fn client_count(&self, tenant: &str) -> usize {
        self.inner
            .registry
            .get(tenant)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn total_clients(&self) -> usize {
        self.inner
            .registry
            .iter()
            .map(|entry| entry.value().receiver_count())
            .sum()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether the relay currently holds a live transport subscription.
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Stops the relay and ends every local subscription. Safe to call more than once.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        self.inner.registry.clear();
        let relay = self
            .inner
            .relay
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = relay {
            if let Err(err) = handle.await {
                warn!(error = %err, "broker relay task ended abnormally");
            }
        }
        info!("event broker closed");
    }
}

async fn run_relay(
    transport: SharedTransport,
    mut stream: EnvelopeStream,
    registry: Registry,
    online: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            next = stream.next() => match next {
                Some(envelope) => {
                    if let Some(tx) = registry.get(&envelope.tenant) {
                        // Err only means every local subscriber just went away.
                        let _ = tx.send(envelope.message);
                    }
                    continue;
                }
                None => {
                    warn!(clients = registry.len(), "broker transport stream ended, closing local streams");
                    online.store(false, Ordering::Release);
                    registry.clear();
                    metrics::counter!("relay_broker_transport_lost_total").increment(1);
                }
            },
        }

        match resubscribe(transport.as_ref(), &mut shutdown).await {
            Some(next) => {
                stream = next;
                online.store(true, Ordering::Release);
                info!("broker transport resubscribed");
            }
            None => return,
        }
    }
}

/// Retries the transport subscription until it succeeds or the broker shuts down.
async fn resubscribe(
    transport: &dyn BrokerTransport,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<EnvelopeStream> {
    let mut backoff = RESUBSCRIBE_INITIAL_BACKOFF;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return None,
            _ = tokio::time::sleep(backoff) => {}
        }
        match transport.subscribe().await {
            Ok(stream) => return Some(stream),
            Err(err) => {
                warn!(error = %err, retry_ms = backoff.as_millis() as u64, "broker resubscribe failed");
                backoff = (backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF);
            }
        }
    }
}

/// Live, backpressured view of one tenant's events.
pub struct Subscription {
    tenant: String,
    receiver: broadcast::Receiver<BrokerMessage>,
    queue: Weak<broadcast::Sender<BrokerMessage>>,
    registry: Registry,
    dropped: u64,
}

impl Subscription {
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Events discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next event, or `None` once the broker closed or lost its transport.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                    metrics::counter!("relay_broker_dropped_total").increment(skipped);
                    warn!(tenant = %self.tenant, skipped, "slow stream subscriber, dropped oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(mut self) -> BoxStream<'static, BrokerMessage> {
        Box::pin(async_stream::stream! {
            while let Some(message) = self.recv().await {
                yield message;
            }
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Our own receiver is still counted here. A queue created after the registry was
        // cleared belongs to other subscribers.
        self.registry.remove_if(&self.tenant, |_, tx| {
            Arc::as_ptr(tx) == self.queue.as_ptr() && tx.receiver_count() <= 1
        });
    }
}
