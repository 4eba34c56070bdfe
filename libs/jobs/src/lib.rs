//! Periodic expiry of abandoned work.
//!
//! Each sweep is two set-based conditional updates in the store: queued inbound messages
//! past their TTL or callback deadline become `expired`, and pending pairing sessions past
//! their deadline become `expired`. Delivered or acked messages and paired sessions are
//! never touched, so sweeps can run alongside live traffic. When a rate limiter is
//! attached, the sweep also releases its idle window keys.

use std::time::Duration;

use relay_core::{Result, SharedClock, system_clock};
use relay_ratelimit::RateLimiter;
use relay_store::{Repositories, SharedInboundRepository, SharedSessionRepository};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inbound_expired: u64,
    pub sessions_expired: u64,
    pub rate_keys_purged: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.inbound_expired == 0 && self.sessions_expired == 0 && self.rate_keys_purged == 0
    }
}

#[derive(Clone)]
pub struct ExpiryReaper {
    inbound: SharedInboundRepository,
    sessions: SharedSessionRepository,
    every: Duration,
    clock: SharedClock,
    rate_windows: Option<(RateLimiter, Duration)>,
}

impl ExpiryReaper {
    pub fn new(repos: &Repositories, every: Duration) -> Self {
        Self {
            inbound: repos.inbound.clone(),
            sessions: repos.sessions.clone(),
            every,
            clock: system_clock(),
            rate_windows: None,
        }
    }

    /// Also purges limiter keys idle for longer than `retention` on every sweep.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter, retention: Duration) -> Self {
        self.rate_windows = Some((limiter, retention));
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let inbound_expired = self.inbound.expire_stale(now).await?;
        let sessions_expired = self.sessions.expire_pending(now).await?;
        let rate_keys_purged = match &self.rate_windows {
            Some((limiter, retention)) => match limiter.purge_idle(*retention).await {
                Ok(purged) => purged as u64,
                Err(err) => {
                    warn!(error = %err, "rate limit purge failed");
                    0
                }
            },
            None => 0,
        };
        let report = SweepReport {
            inbound_expired,
            sessions_expired,
            rate_keys_purged,
        };
        if report.is_empty() {
            debug!("expiry sweep found nothing to do");
        } else {
            metrics::counter!("relay_reaper_expired_total", "kind" => "inbound")
                .increment(inbound_expired);
            metrics::counter!("relay_reaper_expired_total", "kind" => "session")
                .increment(sessions_expired);
            info!(
                inbound_expired,
                sessions_expired,
                rate_keys_purged,
                "expiry sweep completed"
            );
        }
        Ok(report)
    }

    /// Sweeps immediately, then once per interval until the handle is stopped.
    pub fn start(self) -> ReaperHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticks = interval(self.every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.every.as_secs(), "expiry reaper started");
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticks.tick() => {
                        if let Err(err) = self.sweep_once().await {
                            warn!(error = %err, "expiry sweep failed");
                        }
                    }
                }
            }
            info!("expiry reaper stopped");
        });
        ReaperHandle { shutdown, task }
    }
}

pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Lets an in-flight sweep finish; no sweep starts after this returns.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "expiry reaper task ended abnormally");
        }
    }
}
