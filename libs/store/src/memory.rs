use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use relay_core::{
    Account, ConversationMapping, InboundMessage, InboundStatus, MappingState, OutboundMessage,
    OutboundStatus, Session, SessionStatus, new_id,
};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    AccountRepository, ConversationRepository, InboundRepository, Inserted, OutboundRepository,
    PairingClaim, Result, SessionRepository, StoreError,
};

/// Single-lock in-memory store. Rows are kept in insertion order so "oldest first"
/// queries are stable even when timestamps tie.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    accounts: HashMap<String, Account>,
    sessions: Vec<Session>,
    conversations: HashMap<String, ConversationMapping>,
    inbound: Vec<InboundMessage>,
    outbound: Vec<OutboundMessage>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Tables {
    fn session_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    fn unpair_conversation(&mut self, conversation_key: &str, account_id: &str, now: OffsetDateTime) {
        if let Some(mapping) = self.conversations.get_mut(conversation_key) {
            if mapping.account_id == account_id {
                mapping.state = MappingState::Unpaired;
                mapping.updated_at = now;
            }
        }
    }
}

fn count(n: usize) -> u64 {
    n as u64
}

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn insert(&self, account: Account) -> Result<()> {
        let mut tables = self.tables();
        if tables.accounts.contains_key(&account.id) {
            return Err(StoreError::Conflict(format!("account {}", account.id)));
        }
        tables.accounts.insert(account.id.clone(), account);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Account>> {
        Ok(self.tables().accounts.get(id).cloned())
    }

    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<Account>> {
        Ok(self
            .tables()
            .accounts
            .values()
            .find(|a| a.relay_token_hash.as_deref() == Some(token_hash))
            .cloned())
    }

    async fn set_token_hash(
        &self,
        id: &str,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let mut tables = self.tables();
        let Some(account) = tables.accounts.get_mut(id) else {
            return Ok(false);
        };
        account.relay_token_hash = Some(token_hash.to_string());
        account.updated_at = now;
        Ok(true)
    }

    async fn set_rate_limit(&self, id: &str, per_minute: u32, now: OffsetDateTime) -> Result<bool> {
        let mut tables = self.tables();
        let Some(account) = tables.accounts.get_mut(id) else {
            return Ok(false);
        };
        account.rate_limit_per_minute = per_minute;
        account.updated_at = now;
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut tables = self.tables();
        if tables.accounts.remove(id).is_none() {
            return Ok(false);
        }
        let owned = |account_id: &Option<String>| account_id.as_deref() == Some(id);
        tables.sessions.retain(|s| !owned(&s.account_id));
        tables.conversations.retain(|_, m| m.account_id != id);
        tables.inbound.retain(|m| m.account_id != id);
        tables.outbound.retain(|m| m.account_id != id);
        Ok(true)
    }

    async fn count(&self) -> Result<u64> {
        Ok(count(self.tables().accounts.len()))
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Account>> {
        let mut accounts: Vec<_> = self.tables().accounts.values().cloned().collect();
        accounts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(accounts.into_iter().skip(offset).take(limit).collect())
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn insert(&self, session: Session) -> Result<()> {
        let mut tables = self.tables();
        let clash = tables.sessions.iter().any(|s| {
            s.id == session.id
                || (s.status == SessionStatus::PendingPairing
                    && session.status == SessionStatus::PendingPairing
                    && s.pairing_code == session.pairing_code)
        });
        if clash {
            return Err(StoreError::Conflict(format!(
                "pairing code {}",
                relay_core::mask_code(&session.pairing_code)
            )));
        }
        tables.sessions.push(session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.tables().sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>> {
        Ok(self
            .tables()
            .sessions
            .iter()
            .find(|s| s.token_hash == token_hash)
            .cloned())
    }

    async fn find_by_pairing_code(&self, code: &str) -> Result<Option<Session>> {
        Ok(self
            .tables()
            .sessions
            .iter()
            .rev()
            .find(|s| s.pairing_code == code)
            .cloned())
    }

    async fn find_by_conversation(&self, conversation_key: &str) -> Result<Option<Session>> {
        Ok(self
            .tables()
            .sessions
            .iter()
            .filter(|s| s.conversation_key.as_deref() == Some(conversation_key))
            .max_by_key(|s| s.paired_at)
            .cloned())
    }

    async fn claim_pairing(&self, claim: PairingClaim) -> Result<Option<Session>> {
        let mut tables = self.tables();
        let now = claim.now;
        let Some(idx) = tables
            .sessions
            .iter()
            .position(|s| s.pairing_code == claim.pairing_code && s.is_pairable_at(now))
        else {
            return Ok(None);
        };

        let account_id = match tables.sessions[idx].account_id.clone() {
            Some(id) => id,
            None => {
                let account = Account::new(
                    Some(tables.sessions[idx].token_hash.clone()),
                    claim.default_rate_limit_per_minute,
                    now,
                );
                let id = account.id.clone();
                tables.accounts.insert(id.clone(), account);
                id
            }
        };

        for other in tables.sessions.iter_mut() {
            if other.status == SessionStatus::Paired
                && other.conversation_key.as_deref() == Some(claim.conversation_key.as_str())
            {
                other.status = SessionStatus::Disconnected;
            }
        }

        let mapping = tables
            .conversations
            .entry(claim.conversation_key.clone())
            .or_insert_with(|| ConversationMapping {
                id: new_id(),
                conversation_key: claim.conversation_key.clone(),
                account_id: account_id.clone(),
                state: MappingState::Paired,
                created_at: now,
                updated_at: now,
                last_message_at: None,
            });
        mapping.account_id = account_id.clone();
        mapping.state = MappingState::Paired;
        mapping.updated_at = now;

        let session = &mut tables.sessions[idx];
        session.status = SessionStatus::Paired;
        session.account_id = Some(account_id);
        session.conversation_key = Some(claim.conversation_key);
        session.paired_at = Some(now);
        Ok(Some(session.clone()))
    }

    async fn mark_disconnected(&self, id: &str, now: OffsetDateTime) -> Result<bool> {
        let mut tables = self.tables();
        let Some(session) = tables.session_mut(id) else {
            return Ok(false);
        };
        if session.status != SessionStatus::Paired {
            return Ok(false);
        }
        session.status = SessionStatus::Disconnected;
        let binding = session.conversation_key.clone().zip(session.account_id.clone());
        if let Some((conversation_key, account_id)) = binding {
            tables.unpair_conversation(&conversation_key, &account_id, now);
        }
        Ok(true)
    }

    async fn update_metadata(&self, id: &str, metadata: Value) -> Result<bool> {
        let mut tables = self.tables();
        let Some(session) = tables.session_mut(id) else {
            return Ok(false);
        };
        session.metadata = Some(metadata);
        Ok(true)
    }

    async fn delete(&self, id: &str, now: OffsetDateTime) -> Result<bool> {
        let mut tables = self.tables();
        let Some(idx) = tables.sessions.iter().position(|s| s.id == id) else {
            return Ok(false);
        };
        let session = tables.sessions.remove(idx);
        if session.status == SessionStatus::Paired {
            if let (Some(conversation_key), Some(account_id)) =
                (session.conversation_key, session.account_id)
            {
                tables.unpair_conversation(&conversation_key, &account_id, now);
            }
        }
        Ok(true)
    }

    async fn expire_pending(&self, now: OffsetDateTime) -> Result<u64> {
        let mut tables = self.tables();
        let mut expired = 0;
        for session in tables.sessions.iter_mut() {
            if session.status == SessionStatus::PendingPairing && session.expires_at <= now {
                session.status = SessionStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn find_recent(&self, limit: usize) -> Result<Vec<Session>> {
        Ok(self
            .tables()
            .sessions
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self, status: SessionStatus) -> Result<u64> {
        Ok(count(
            self.tables()
                .sessions
                .iter()
                .filter(|s| s.status == status)
                .count(),
        ))
    }
}

#[async_trait]
impl ConversationRepository for MemoryStore {
    async fn get(&self, conversation_key: &str) -> Result<Option<ConversationMapping>> {
        Ok(self.tables().conversations.get(conversation_key).cloned())
    }

    async fn list_for_account(&self, account_id: &str) -> Result<Vec<ConversationMapping>> {
        let mut mappings: Vec<_> = self
            .tables()
            .conversations
            .values()
            .filter(|m| m.account_id == account_id)
            .cloned()
            .collect();
        mappings.sort_by_key(|m| m.created_at);
        Ok(mappings)
    }

    async fn touch(&self, conversation_key: &str, now: OffsetDateTime) -> Result<bool> {
        let mut tables = self.tables();
        let Some(mapping) = tables.conversations.get_mut(conversation_key) else {
            return Ok(false);
        };
        mapping.last_message_at = Some(now);
        mapping.updated_at = now;
        Ok(true)
    }

    async fn delete(&self, conversation_key: &str) -> Result<bool> {
        Ok(self.tables().conversations.remove(conversation_key).is_some())
    }
}

#[async_trait]
impl InboundRepository for MemoryStore {
    async fn insert(&self, message: InboundMessage) -> Result<Inserted<InboundMessage>> {
        let mut tables = self.tables();
        if let Some(source) = message.source_event_id.as_deref() {
            let existing = tables.inbound.iter().find(|m| {
                m.account_id == message.account_id && m.source_event_id.as_deref() == Some(source)
            });
            if let Some(existing) = existing {
                return Ok(Inserted {
                    record: existing.clone(),
                    created: false,
                });
            }
        }
        tables.inbound.push(message.clone());
        Ok(Inserted {
            record: message,
            created: true,
        })
    }

    async fn get(&self, id: &str) -> Result<Option<InboundMessage>> {
        Ok(self.tables().inbound.iter().find(|m| m.id == id).cloned())
    }

    async fn mark_delivered(&self, id: &str, now: OffsetDateTime) -> Result<bool> {
        let mut tables = self.tables();
        match tables.inbound.iter_mut().find(|m| m.id == id) {
            Some(msg) if msg.status == InboundStatus::Queued => {
                msg.status = InboundStatus::Delivered;
                msg.delivered_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_acked(&self, id: &str, now: OffsetDateTime) -> Result<bool> {
        let mut tables = self.tables();
        match tables.inbound.iter_mut().find(|m| m.id == id) {
            Some(msg)
                if matches!(msg.status, InboundStatus::Queued | InboundStatus::Delivered) =>
            {
                msg.status = InboundStatus::Acked;
                msg.acked_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_queued(&self, account_id: &str, limit: usize) -> Result<Vec<InboundMessage>> {
        Ok(self
            .tables()
            .inbound
            .iter()
            .filter(|m| m.account_id == account_id && m.status == InboundStatus::Queued)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn expire_stale(&self, now: OffsetDateTime) -> Result<u64> {
        let mut tables = self.tables();
        let mut expired = 0;
        for msg in tables.inbound.iter_mut() {
            let past_callback = msg.callback_expires_at.is_some_and(|at| at <= now);
            if msg.status == InboundStatus::Queued && (msg.expires_at <= now || past_callback) {
                msg.status = InboundStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn count_for_account(
        &self,
        account_id: &str,
        since: Option<OffsetDateTime>,
    ) -> Result<u64> {
        Ok(count(
            self.tables()
                .inbound
                .iter()
                .filter(|m| m.account_id == account_id)
                .filter(|m| since.is_none_or(|since| m.created_at >= since))
                .count(),
        ))
    }

    async fn count_by_status(&self, status: InboundStatus) -> Result<u64> {
        Ok(count(
            self.tables()
                .inbound
                .iter()
                .filter(|m| m.status == status)
                .count(),
        ))
    }

    async fn list_for_account(
        &self,
        account_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<InboundMessage>> {
        Ok(self
            .tables()
            .inbound
            .iter()
            .rev()
            .filter(|m| m.account_id == account_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OutboundRepository for MemoryStore {
    async fn insert(&self, message: OutboundMessage) -> Result<()> {
        self.tables().outbound.push(message);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<OutboundMessage>> {
        Ok(self.tables().outbound.iter().find(|m| m.id == id).cloned())
    }

    async fn mark_sent(
        &self,
        id: &str,
        inbound_id: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let mut tables = self.tables();
        match tables.outbound.iter_mut().find(|m| m.id == id) {
            Some(msg) if msg.status != OutboundStatus::Sent => {
                msg.status = OutboundStatus::Sent;
                msg.sent_at = Some(now);
                msg.error_message = None;
                if let Some(inbound_id) = inbound_id {
                    msg.inbound_id = Some(inbound_id.to_string());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<bool> {
        let mut tables = self.tables();
        match tables.outbound.iter_mut().find(|m| m.id == id) {
            Some(msg) if msg.status == OutboundStatus::Pending => {
                msg.status = OutboundStatus::Failed;
                msg.error_message = Some(error.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_pending(
        &self,
        account_id: &str,
        conversation_key: &str,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>> {
        Ok(self
            .tables()
            .outbound
            .iter()
            .filter(|m| {
                m.account_id == account_id
                    && m.conversation_key == conversation_key
                    && m.status == OutboundStatus::Pending
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_for_account(
        &self,
        account_id: &str,
        since: Option<OffsetDateTime>,
    ) -> Result<u64> {
        Ok(count(
            self.tables()
                .outbound
                .iter()
                .filter(|m| m.account_id == account_id)
                .filter(|m| since.is_none_or(|since| m.created_at >= since))
                .count(),
        ))
    }

    async fn count_failed(&self, account_id: Option<&str>) -> Result<u64> {
        Ok(count(
            self.tables()
                .outbound
                .iter()
                .filter(|m| m.status == OutboundStatus::Failed)
                .filter(|m| account_id.is_none_or(|id| m.account_id == id))
                .count(),
        ))
    }

    async fn list_for_account(
        &self,
        account_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<OutboundMessage>> {
        Ok(self
            .tables()
            .outbound
            .iter()
            .rev()
            .filter(|m| m.account_id == account_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_failed(&self, account_id: &str, limit: usize) -> Result<Vec<OutboundMessage>> {
        Ok(self
            .tables()
            .outbound
            .iter()
            .rev()
            .filter(|m| m.account_id == account_id && m.status == OutboundStatus::Failed)
            .take(limit)
            .cloned()
            .collect())
    }
}
