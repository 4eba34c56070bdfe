//! Correlates chat events with consumer replies.
//!
//! The chat platform expects an answer inside a short window while the stream consumer may
//! take longer. [`MessageCorrelator`] records each inbound event, publishes it to the
//! tenant's stream, and lets the webhook wait for a reply until a deadline. A reply created
//! while a waiter is open goes straight to that waiter; otherwise it stays `pending` for a
//! later poll or callback delivery.
//!
//! Waiters live in the process that took the webhook call. A reply created on another
//! process is offered on [`REPLY_OFFER_CHANNEL`]; each process listening there claims it
//! through the guarded `pending | failed -> sent` update before answering its own waiter,
//! so at most one webhook receives it.

mod waiters;

use std::{str::FromStr, time::Duration};

use relay_broker::{BrokerError, BrokerMessage, EventBroker, Subscription};
use relay_core::{
    InboundMessage, InboundStatus, OutboundMessage, OutboundStatus, QuickStats, RelayError,
    Result, SharedClock, new_id, system_clock,
};
use relay_store::{
    Repositories, SharedConversationRepository, SharedInboundRepository,
    SharedOutboundRepository,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, Time};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tracing::{debug, info, instrument, warn};

use crate::waiters::{Registration, WaiterTable};

pub const MESSAGE_EVENT: &str = "message";
/// Broker channel carrying replies that found no waiter in the process that stored them.
pub const REPLY_OFFER_CHANNEL: &str = "relay:reply-offers";
const REPLY_OFFER_EVENT: &str = "reply_offer";
const OFFER_LISTENER_RETRY: Duration = Duration::from_millis(500);

/// Which open waiter receives a reply when several wait on one conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    #[default]
    OldestFirst,
    NewestFirst,
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oldest_first" | "oldest" | "fifo" => Ok(Self::OldestFirst),
            "newest_first" | "newest" | "lifo" => Ok(Self::NewestFirst),
            other => Err(format!("unknown match policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    pub queue_ttl: Duration,
    pub match_policy: MatchPolicy,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            queue_ttl: Duration::from_secs(900),
            match_policy: MatchPolicy::OldestFirst,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewInbound {
    pub account_id: String,
    pub conversation_key: String,
    pub platform_payload: Value,
    pub normalized_payload: Value,
    pub callback_url: Option<String>,
    pub callback_expires_at: Option<OffsetDateTime>,
    pub source_event_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InboundCreated {
    pub message: InboundMessage,
    /// The source event id was seen before; nothing new was stored or published.
    pub duplicate: bool,
}

#[derive(Debug, Clone)]
pub struct NewOutbound {
    pub account_id: String,
    pub conversation_key: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct OutboundCreated {
    pub message: OutboundMessage,
    pub matched_inbound: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Reply(OutboundMessage),
    TimedOut,
}

/// Registered interest in the reply to one inbound message.
pub struct ReplyWaiter {
    rx: oneshot::Receiver<OutboundMessage>,
    _registration: Option<Registration>,
}

impl ReplyWaiter {
    /// A waiter no reply can reach; `wait` returns `TimedOut` at once.
    fn settled() -> Self {
        let (_, rx) = oneshot::channel();
        Self {
            rx,
            _registration: None,
        }
    }

    /// Resolves with the matched reply, or `TimedOut` at `deadline`. Once this returns
    /// `TimedOut` no later reply can be handed to this waiter.
    pub async fn wait(mut self, deadline: Instant) -> ReplyOutcome {
        tokio::select! {
            biased;
            reply = &mut self.rx => {
                if let Ok(reply) = reply {
                    return ReplyOutcome::Reply(reply);
                }
            }
            _ = tokio::time::sleep_until(deadline) => {}
        }
        // Close first so a concurrent hand-off either landed already or fails and moves on.
        self.rx.close();
        match self.rx.try_recv() {
            Ok(reply) => ReplyOutcome::Reply(reply),
            Err(_) => ReplyOutcome::TimedOut,
        }
    }
}

#[derive(Clone)]
pub struct MessageCorrelator {
    inbound: SharedInboundRepository,
    outbound: SharedOutboundRepository,
    conversations: SharedConversationRepository,
    broker: EventBroker,
    clock: SharedClock,
    config: CorrelatorConfig,
    waiters: WaiterTable,
}

impl MessageCorrelator {
    pub fn new(repos: &Repositories, broker: EventBroker, config: CorrelatorConfig) -> Self {
        Self {
            inbound: repos.inbound.clone(),
            outbound: repos.outbound.clone(),
            conversations: repos.conversations.clone(),
            broker,
            clock: system_clock(),
            config,
            waiters: WaiterTable::default(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Stores the event as `queued` and announces it on the tenant's stream.
    pub async fn create_inbound(&self, new: NewInbound) -> Result<InboundCreated> {
        let created = self.persist_inbound(new).await?;
        if !created.duplicate {
            self.announce(&created.message).await;
        }
        Ok(created)
    }

    /// Like [`create_inbound`](Self::create_inbound) but registers the reply waiter before
    /// the event is announced, so a fast consumer cannot answer ahead of the wait. A
    /// redelivered event that was already acked or expired gets a settled waiter and never
    /// competes for new replies.
    pub async fn create_inbound_awaiting(
        &self,
        new: NewInbound,
    ) -> Result<(InboundCreated, ReplyWaiter)> {
        let created = self.persist_inbound(new).await?;
        let waiter = if created.duplicate && !created.message.status.awaits_reply() {
            debug!(
                message_id = %created.message.id,
                status = %created.message.status,
                "duplicate of a settled event, not waiting for a reply"
            );
            ReplyWaiter::settled()
        } else {
            self.register(&created.message)
        };
        if !created.duplicate {
            self.announce(&created.message).await;
        }
        Ok((created, waiter))
    }

    #[instrument(name = "messages.inbound", skip(self, new), fields(tenant = %new.account_id, conversation_key = %new.conversation_key))]
    async fn persist_inbound(&self, new: NewInbound) -> Result<InboundCreated> {
        let now = self.clock.now();
        let message = InboundMessage {
            id: new_id(),
            account_id: new.account_id,
            conversation_key: new.conversation_key,
            platform_payload: new.platform_payload,
            normalized_payload: new.normalized_payload,
            callback_url: new.callback_url,
            callback_expires_at: new.callback_expires_at,
            source_event_id: new.source_event_id,
            status: InboundStatus::Queued,
            created_at: now,
            expires_at: now + self.config.queue_ttl,
            delivered_at: None,
            acked_at: None,
        };
        let inserted = self.inbound.insert(message).await?;
        if !inserted.created {
            debug!(message_id = %inserted.record.id, "duplicate source event, reusing inbound record");
            return Ok(InboundCreated {
                message: inserted.record,
                duplicate: true,
            });
        }
        if let Err(err) = self
            .conversations
            .touch(&inserted.record.conversation_key, now)
            .await
        {
            warn!(error = %err, "failed to update conversation activity");
        }
        metrics::counter!("relay_inbound_created_total").increment(1);
        info!(message_id = %inserted.record.id, "inbound message queued");
        Ok(InboundCreated {
            message: inserted.record,
            duplicate: false,
        })
    }

    async fn announce(&self, message: &InboundMessage) {
        let data = match serde_json::to_value(message) {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, message_id = %message.id, "failed to encode inbound event");
                return;
            }
        };
        let event = BrokerMessage::new(MESSAGE_EVENT, data).with_id(message.id.clone());
        if let Err(err) = self.broker.publish(&message.account_id, event).await {
            warn!(error = %err, message_id = %message.id, tenant = %message.account_id, "failed to publish inbound event");
        }
    }

    fn register(&self, message: &InboundMessage) -> ReplyWaiter {
        let (rx, registration) = self.waiters.register(
            &message.account_id,
            &message.conversation_key,
            &message.id,
            message.created_at,
        );
        ReplyWaiter {
            rx,
            _registration: Some(registration),
        }
    }

    /// Waits until a reply for `inbound_id` arrives or `deadline` passes. Dropping the
    /// returned future releases the registration.
    pub async fn await_reply(&self, inbound_id: &str, deadline: Instant) -> Result<ReplyOutcome> {
        let message = self
            .inbound
            .get(inbound_id)
            .await?
            .ok_or_else(|| RelayError::not_found("inbound message"))?;
        Ok(self.register(&message).wait(deadline).await)
    }

    #[instrument(name = "messages.outbound", skip(self, new), fields(tenant = %new.account_id, conversation_key = %new.conversation_key))]
    pub async fn create_outbound(&self, new: NewOutbound) -> Result<OutboundCreated> {
        let now = self.clock.now();
        let mut message = OutboundMessage {
            id: new_id(),
            account_id: new.account_id,
            conversation_key: new.conversation_key,
            inbound_id: None,
            payload: new.payload,
            status: OutboundStatus::Pending,
            error_message: None,
            created_at: now,
            sent_at: None,
        };
        self.outbound.insert(message.clone()).await?;
        metrics::counter!("relay_outbound_created_total").increment(1);

        let pending = message.clone();
        let matched = self.waiters.resolve(
            &message.account_id,
            &message.conversation_key,
            self.config.match_policy,
            |inbound_id| OutboundMessage {
                inbound_id: Some(inbound_id.to_string()),
                status: OutboundStatus::Sent,
                sent_at: Some(now),
                ..pending.clone()
            },
        );

        if let Some(inbound_id) = &matched {
            self.outbound
                .mark_sent(&message.id, Some(inbound_id), now)
                .await?;
            self.inbound.mark_acked(inbound_id, now).await?;
            message.inbound_id = Some(inbound_id.clone());
            message.status = OutboundStatus::Sent;
            message.sent_at = Some(now);
            metrics::counter!("relay_replies_matched_total", "via" => "local").increment(1);
            info!(outbound_id = %message.id, inbound_id = %inbound_id, "reply handed to waiting webhook");
        } else {
            debug!(outbound_id = %message.id, "no open waiter, reply left pending");
        }

        Ok(OutboundCreated {
            message,
            matched_inbound: matched,
        })
    }

    /// Offers a still pending reply to waiters held by other relay processes. Whichever
    /// process claims it first answers its webhook; the reply otherwise stays pending.
    pub async fn offer_pending(&self, reply: &OutboundMessage) {
        let data = match serde_json::to_value(reply) {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, outbound_id = %reply.id, "failed to encode reply offer");
                return;
            }
        };
        let offer = BrokerMessage::new(REPLY_OFFER_EVENT, data).with_id(reply.id.clone());
        if let Err(err) = self.broker.publish(REPLY_OFFER_CHANNEL, offer).await {
            warn!(error = %err, outbound_id = %reply.id, "failed to publish reply offer");
        }
    }

    /// Starts answering local waiters with replies offered by any process. Offers published
    /// after this returns are seen. The task ends when the broker closes and resubscribes
    /// while the broker transport reconnects.
    pub fn spawn_offer_listener(&self) -> JoinHandle<()> {
        let first = self.broker.subscribe(REPLY_OFFER_CHANNEL).ok();
        let correlator = self.clone();
        tokio::spawn(async move { correlator.listen_for_offers(first).await })
    }

    async fn listen_for_offers(self, mut next: Option<Subscription>) {
        loop {
            let mut offers = match next.take() {
                Some(offers) => offers,
                None => match self.broker.subscribe(REPLY_OFFER_CHANNEL) {
                    Ok(offers) => offers,
                    Err(BrokerError::Closed) => break,
                    Err(err) => {
                        debug!(error = %err, "reply offers unavailable, retrying");
                        tokio::time::sleep(OFFER_LISTENER_RETRY).await;
                        continue;
                    }
                },
            };
            while let Some(offer) = offers.recv().await {
                match serde_json::from_value::<OutboundMessage>(offer.data) {
                    Ok(reply) => self.claim_offer(reply).await,
                    Err(err) => warn!(error = %err, "dropping malformed reply offer"),
                }
            }
            if self.broker.is_closed() {
                break;
            }
        }
        debug!("reply offer listener stopped");
    }

    /// Claims an offered reply for a local waiter. The store decides the winner; a lost
    /// claim returns the waiter to the table.
    async fn claim_offer(&self, reply: OutboundMessage) {
        let Some(claimed) = self.waiters.claim(
            &reply.account_id,
            &reply.conversation_key,
            self.config.match_policy,
        ) else {
            return;
        };
        let inbound_id = claimed.inbound_id().to_string();
        let now = self.clock.now();
        match self.outbound.mark_sent(&reply.id, Some(&inbound_id), now).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(outbound_id = %reply.id, "offered reply already settled");
                self.waiters.release(claimed);
                return;
            }
            Err(err) => {
                warn!(error = %err, outbound_id = %reply.id, "failed to claim offered reply");
                self.waiters.release(claimed);
                return;
            }
        }

        let outbound_id = reply.id.clone();
        let answered = claimed.answer(OutboundMessage {
            inbound_id: Some(inbound_id.clone()),
            status: OutboundStatus::Sent,
            sent_at: Some(now),
            ..reply
        });
        if answered.is_err() {
            warn!(outbound_id = %outbound_id, inbound_id = %inbound_id, "webhook stopped waiting while the reply was claimed");
            return;
        }
        if let Err(err) = self.inbound.mark_acked(&inbound_id, now).await {
            warn!(error = %err, inbound_id = %inbound_id, "failed to ack inbound after hand-off");
        }
        metrics::counter!("relay_replies_matched_total", "via" => "offer").increment(1);
        info!(outbound_id = %outbound_id, inbound_id = %inbound_id, "offered reply handed to waiting webhook");
    }

    /// `queued -> delivered`; repeating it is a no-op.
    pub async fn mark_delivered(&self, id: &str) -> Result<()> {
        if !self.inbound.mark_delivered(id, self.clock.now()).await? {
            self.ensure_inbound(id).await?;
        }
        Ok(())
    }

    /// `queued | delivered -> acked`; repeating it is a no-op.
    pub async fn mark_acked(&self, id: &str) -> Result<()> {
        if !self.inbound.mark_acked(id, self.clock.now()).await? {
            self.ensure_inbound(id).await?;
        }
        Ok(())
    }

    async fn ensure_inbound(&self, id: &str) -> Result<InboundMessage> {
        self.inbound
            .get(id)
            .await?
            .ok_or_else(|| RelayError::not_found("inbound message"))
    }

    pub async fn get_inbound(&self, id: &str) -> Result<InboundMessage> {
        self.ensure_inbound(id).await
    }

    pub async fn mark_outbound_sent(&self, id: &str) -> Result<()> {
        if !self.outbound.mark_sent(id, None, self.clock.now()).await? {
            self.ensure_outbound(id).await?;
        }
        Ok(())
    }

    pub async fn mark_outbound_failed(&self, id: &str, error: &str) -> Result<()> {
        if !self.outbound.mark_failed(id, error).await? {
            self.ensure_outbound(id).await?;
        }
        warn!(outbound_id = id, error, "outbound delivery failed");
        Ok(())
    }

    async fn ensure_outbound(&self, id: &str) -> Result<OutboundMessage> {
        self.outbound
            .get(id)
            .await?
            .ok_or_else(|| RelayError::not_found("outbound message"))
    }

    pub async fn pending_outbound(
        &self,
        account_id: &str,
        conversation_key: &str,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>> {
        Ok(self
            .outbound
            .find_pending(account_id, conversation_key, limit)
            .await?)
    }

    /// Queued backlog replayed to a freshly connected stream, oldest first.
    pub async fn queued_for(&self, account_id: &str, limit: usize) -> Result<Vec<InboundMessage>> {
        Ok(self.inbound.find_queued(account_id, limit).await?)
    }

    /// Message counts for the tenant; "today" starts at UTC midnight.
    pub async fn get_quick_stats(&self, account_id: &str) -> Result<QuickStats> {
        let midnight = self.clock.now().replace_time(Time::MIDNIGHT);
        Ok(QuickStats {
            inbound_today: self
                .inbound
                .count_for_account(account_id, Some(midnight))
                .await?,
            inbound_total: self.inbound.count_for_account(account_id, None).await?,
            outbound_today: self
                .outbound
                .count_for_account(account_id, Some(midnight))
                .await?,
            outbound_total: self.outbound.count_for_account(account_id, None).await?,
            outbound_failed: self.outbound.count_failed(Some(account_id)).await?,
        })
    }

    #[cfg(test)]
    fn open_waiters(&self) -> usize {
        self.waiters.open_waiters()
    }
}
