use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use relay_core::OutboundMessage;
use time::OffsetDateTime;
use tokio::sync::oneshot;

use crate::MatchPolicy;

type ConversationId = (String, String);

struct Waiter {
    seq: u64,
    inbound_id: String,
    inbound_created_at: OffsetDateTime,
    tx: oneshot::Sender<OutboundMessage>,
}

/// Open `await_reply` registrations, grouped by `(tenant, conversation)`.
#[derive(Clone, Default)]
pub(crate) struct WaiterTable {
    by_conversation: Arc<DashMap<ConversationId, Vec<Waiter>>>,
    next_seq: Arc<AtomicU64>,
}

impl WaiterTable {
    pub(crate) fn register(
        &self,
        account_id: &str,
        conversation_key: &str,
        inbound_id: &str,
        inbound_created_at: OffsetDateTime,
    ) -> (oneshot::Receiver<OutboundMessage>, Registration) {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let key = (account_id.to_string(), conversation_key.to_string());
        self.by_conversation
            .entry(key.clone())
            .or_default()
            .push(Waiter {
                seq,
                inbound_id: inbound_id.to_string(),
                inbound_created_at,
                tx,
            });
        let registration = Registration {
            table: self.clone(),
            key,
            seq,
        };
        (rx, registration)
    }

    /// Hands `reply` to one open waiter chosen by `policy`, returning the inbound id it
    /// answered. Waiters whose receiver is already gone are discarded along the way.
    pub(crate) fn resolve(
        &self,
        account_id: &str,
        conversation_key: &str,
        policy: MatchPolicy,
        reply: impl Fn(&str) -> OutboundMessage,
    ) -> Option<String> {
        while let Some(claimed) = self.claim(account_id, conversation_key, policy) {
            let inbound_id = claimed.waiter.inbound_id.clone();
            if claimed.answer(reply(&inbound_id)).is_ok() {
                return Some(inbound_id);
            }
        }
        None
    }

    /// Takes the waiter `policy` picks out of the table without answering it. The caller
    /// either answers it or hands it back with [`release`](Self::release).
    pub(crate) fn claim(
        &self,
        account_id: &str,
        conversation_key: &str,
        policy: MatchPolicy,
    ) -> Option<Claimed> {
        let key = (account_id.to_string(), conversation_key.to_string());
        let picked = {
            let mut waiters = self.by_conversation.get_mut(&key)?;
            waiters.retain(|w| !w.tx.is_closed());
            let ordering = waiters
                .iter()
                .enumerate()
                .map(|(idx, w)| (idx, (w.inbound_created_at, w.seq)));
            let picked = match policy {
                MatchPolicy::OldestFirst => ordering.min_by_key(|(_, order)| *order),
                MatchPolicy::NewestFirst => ordering.max_by_key(|(_, order)| *order),
            };
            picked.map(|(idx, _)| waiters.remove(idx))
        };
        self.by_conversation.remove_if(&key, |_, waiters| waiters.is_empty());
        picked.map(|waiter| Claimed { key, waiter })
    }

    /// Puts a claimed waiter back unless its webhook already gave up.
    pub(crate) fn release(&self, claimed: Claimed) {
        if claimed.waiter.tx.is_closed() {
            return;
        }
        self.by_conversation
            .entry(claimed.key)
            .or_default()
            .push(claimed.waiter);
    }

    fn deregister(&self, key: &ConversationId, seq: u64) {
        if let Some(mut waiters) = self.by_conversation.get_mut(key) {
            waiters.retain(|w| w.seq != seq);
        }
        self.by_conversation
            .remove_if(key, |_, waiters| waiters.is_empty());
    }

    #[cfg(test)]
    pub(crate) fn open_waiters(&self) -> usize {
        self.by_conversation.iter().map(|e| e.value().len()).sum()
    }
}

/// A waiter taken out of the table, not yet answered.
pub(crate) struct Claimed {
    key: ConversationId,
    waiter: Waiter,
}

impl Claimed {
    pub(crate) fn inbound_id(&self) -> &str {
        &self.waiter.inbound_id
    }

    /// Fails with the reply when the webhook stopped waiting.
    pub(crate) fn answer(self, reply: OutboundMessage) -> Result<(), OutboundMessage> {
        self.waiter.tx.send(reply)
    }
}

/// Removes its waiter from the table when dropped.
pub(crate) struct Registration {
    table: WaiterTable,
    key: ConversationId,
    seq: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.table.deregister(&self.key, self.seq);
    }
}
