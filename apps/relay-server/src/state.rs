use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use relay_broker::{BrokerConfig, EventBroker, MemoryTransport, SharedTransport};
use relay_core::{SharedClock, TokenHasher};
use relay_jobs::ExpiryReaper;
use relay_messages::{CorrelatorConfig, MessageCorrelator};
use relay_ratelimit::{MemoryWindowStore, RateLimiter, SharedWindowStore};
use relay_session::{SessionConfig, SessionManager};
use relay_store::Repositories;
use tracing::{info, warn};

use crate::config::RelayConfig;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Longer than any limiter window the relay uses.
const RATE_KEY_RETENTION: Duration = Duration::from_secs(10 * 60);

/// Process-wide services shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub repos: Repositories,
    pub limiter: RateLimiter,
    pub broker: EventBroker,
    pub sessions: SessionManager,
    pub messages: MessageCorrelator,
    pub http: reqwest::Client,
}

impl AppState {
    /// Connects the configured backends: SQLite for rows, Redis (when set) for rate limits
    /// and cross-process events.
    pub async fn connect(config: RelayConfig) -> Result<Self> {
        let repos = open_repositories(&config)?;
        let (window_store, transport) = shared_backends(&config).await?;
        Self::assemble(config, repos, window_store, transport, None).await
    }

    /// Everything in process memory; used by tests and local experiments.
    pub async fn in_memory(config: RelayConfig) -> Result<Self> {
        Self::assemble(
            config,
            Repositories::memory(),
            Arc::new(MemoryWindowStore::new()),
            Arc::new(MemoryTransport::new()),
            None,
        )
        .await
    }

    pub async fn in_memory_with_clock(config: RelayConfig, clock: SharedClock) -> Result<Self> {
        Self::assemble(
            config,
            Repositories::memory(),
            Arc::new(MemoryWindowStore::new()),
            Arc::new(MemoryTransport::new()),
            Some(clock),
        )
        .await
    }

    async fn assemble(
        config: RelayConfig,
        repos: Repositories,
        window_store: SharedWindowStore,
        transport: SharedTransport,
        clock: Option<SharedClock>,
    ) -> Result<Self> {
        let hasher = TokenHasher::new(&config.token_hash_secret)?;
        let broker = EventBroker::start(
            transport,
            BrokerConfig {
                subscriber_buffer: config.broker_buffer,
            },
        )
        .await
        .context("starting event broker")?;

        let mut limiter = RateLimiter::new(window_store);
        if let Some(clock) = &clock {
            limiter = limiter.with_clock(clock.clone());
        }
        let mut sessions = SessionManager::new(
            &repos,
            limiter.clone(),
            hasher,
            SessionConfig {
                pairing_ttl: config.pairing_ttl,
                default_rate_limit_per_minute: config.default_rate_limit_per_minute,
                ..SessionConfig::default()
            },
        )
        .with_broker(broker.clone());
        let mut messages = MessageCorrelator::new(
            &repos,
            broker.clone(),
            CorrelatorConfig {
                queue_ttl: config.queue_ttl,
                match_policy: config.match_policy,
            },
        );
        if let Some(clock) = clock {
            sessions = sessions.with_clock(clock.clone());
            messages = messages.with_clock(clock);
        }
        messages.spawn_offer_listener();

        let http = reqwest::Client::builder()
            .timeout(CALLBACK_TIMEOUT)
            .build()
            .context("building callback client")?;

        Ok(Self {
            config: Arc::new(config),
            repos,
            limiter,
            broker,
            sessions,
            messages,
            http,
        })
    }

    pub fn reaper(&self) -> ExpiryReaper {
        ExpiryReaper::new(&self.repos, self.config.reaper_interval)
            .with_rate_limiter(self.limiter.clone(), RATE_KEY_RETENTION)
    }
}

#[cfg(feature = "sqlite")]
fn open_repositories(config: &RelayConfig) -> Result<Repositories> {
    let repos = Repositories::sqlite(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path))?;
    info!(path = %config.database_path, "sqlite store opened");
    Ok(repos)
}

#[cfg(not(feature = "sqlite"))]
fn open_repositories(config: &RelayConfig) -> Result<Repositories> {
    warn!(path = %config.database_path, "built without sqlite; rows are kept in memory");
    Ok(Repositories::memory())
}

#[cfg(feature = "redis")]
async fn shared_backends(config: &RelayConfig) -> Result<(SharedWindowStore, SharedTransport)> {
    let Some(url) = config.redis_url.as_deref() else {
        warn!("REDIS_URL not set; rate limits and events are process-local");
        return Ok(local_backends());
    };
    let window_store =
        relay_ratelimit::RedisWindowStore::connect(url, config.redis_namespace.clone())
            .await
            .context("connecting rate-limit store")?;
    let transport = relay_broker::RedisTransport::connect(url, config.redis_namespace.clone())
        .await
        .context("connecting broker transport")?;
    info!(namespace = %config.redis_namespace, "redis backends connected");
    Ok((Arc::new(window_store), Arc::new(transport)))
}

#[cfg(not(feature = "redis"))]
async fn shared_backends(config: &RelayConfig) -> Result<(SharedWindowStore, SharedTransport)> {
    if config.redis_url.is_some() {
        anyhow::bail!("REDIS_URL is set but relay-server was built without the `redis` feature");
    }
    Ok(local_backends())
}

fn local_backends() -> (SharedWindowStore, SharedTransport) {
    (
        Arc::new(MemoryWindowStore::new()),
        Arc::new(MemoryTransport::new()),
    )
}
