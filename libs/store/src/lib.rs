//! Persistence collaborator for the relay.
//!
//! Every state transition is expressed as a guarded conditional update: callers learn
//! whether their transition applied (`bool`, `Option`) instead of reading and writing in
//! two steps. Sweeps report how many rows they touched.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::sync::Arc;

use anyhow::Error;
use async_trait::async_trait;
use relay_core::{
    Account, ConversationMapping, InboundMessage, InboundStatus, OutboundMessage, RelayError,
    Session, SessionStatus,
};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("conflicting record: {0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => RelayError::not_found("record"),
            StoreError::Conflict(what) => RelayError::Storage(anyhow::anyhow!("conflict: {what}")),
            StoreError::Internal(err) => RelayError::Storage(err),
        }
    }
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, PartialEq)]
pub struct Inserted<T> {
    pub record: T,
    pub created: bool,
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn insert(&self, account: Account) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Account>>;
    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<Account>>;
    async fn set_token_hash(&self, id: &str, token_hash: &str, now: OffsetDateTime)
    -> Result<bool>;
    async fn set_rate_limit(&self, id: &str, per_minute: u32, now: OffsetDateTime) -> Result<bool>;
    /// Removes the account together with its sessions, conversations and messages.
    async fn delete(&self, id: &str) -> Result<bool>;
    async fn count(&self) -> Result<u64>;
    /// Newest accounts first.
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Account>>;
}

/// Parameters for the atomic pairing claim.
#[derive(Debug, Clone)]
pub struct PairingClaim {
    pub pairing_code: String,
    pub conversation_key: String,
    pub default_rate_limit_per_minute: u32,
    pub now: OffsetDateTime,
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when another pending session holds the code.
    async fn insert(&self, session: Session) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Session>>;
    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>>;
    /// Newest session carrying the code, whatever its status.
    async fn find_by_pairing_code(&self, code: &str) -> Result<Option<Session>>;
    /// Newest session bound to the conversation, whatever its status.
    async fn find_by_conversation(&self, conversation_key: &str) -> Result<Option<Session>>;
    /// Atomically moves the pending, unexpired session holding the code to `paired`.
    ///
    /// In the same transaction the owning account is provisioned when missing, any other
    /// session paired to the conversation is disconnected, and the conversation mapping is
    /// pointed at the account. Returns `None` when nothing was claimable.
    async fn claim_pairing(&self, claim: PairingClaim) -> Result<Option<Session>>;
    /// `paired -> disconnected`; the conversation mapping becomes `unpaired`.
    async fn mark_disconnected(&self, id: &str, now: OffsetDateTime) -> Result<bool>;
    async fn update_metadata(&self, id: &str, metadata: Value) -> Result<bool>;
    /// Deletes the session and releases its conversation mapping.
    async fn delete(&self, id: &str, now: OffsetDateTime) -> Result<bool>;
    /// `pending_pairing -> expired` for sessions past their pairing deadline.
    async fn expire_pending(&self, now: OffsetDateTime) -> Result<u64>;
    async fn find_recent(&self, limit: usize) -> Result<Vec<Session>>;
    async fn count_by_status(&self, status: SessionStatus) -> Result<u64>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn get(&self, conversation_key: &str) -> Result<Option<ConversationMapping>>;
    async fn list_for_account(&self, account_id: &str) -> Result<Vec<ConversationMapping>>;
    async fn touch(&self, conversation_key: &str, now: OffsetDateTime) -> Result<bool>;
    async fn delete(&self, conversation_key: &str) -> Result<bool>;
}

#[async_trait]
pub trait InboundRepository: Send + Sync {
    /// Inserts the message unless the tenant already recorded the same source event id.
    async fn insert(&self, message: InboundMessage) -> Result<Inserted<InboundMessage>>;
    async fn get(&self, id: &str) -> Result<Option<InboundMessage>>;
    /// `queued -> delivered`.
    async fn mark_delivered(&self, id: &str, now: OffsetDateTime) -> Result<bool>;
    /// `queued | delivered -> acked`.
    async fn mark_acked(&self, id: &str, now: OffsetDateTime) -> Result<bool>;
    /// Queued messages for the account, oldest first.
    async fn find_queued(&self, account_id: &str, limit: usize) -> Result<Vec<InboundMessage>>;
    /// `queued -> expired` past either the TTL or the callback deadline.
    async fn expire_stale(&self, now: OffsetDateTime) -> Result<u64>;
    async fn count_for_account(
        &self,
        account_id: &str,
        since: Option<OffsetDateTime>,
    ) -> Result<u64>;
    async fn count_by_status(&self, status: InboundStatus) -> Result<u64>;
    /// Every message of the tenant, newest first.
    async fn list_for_account(
        &self,
        account_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<InboundMessage>>;
}

#[async_trait]
pub trait OutboundRepository: Send + Sync {
    async fn insert(&self, message: OutboundMessage) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<OutboundMessage>>;
    /// `pending | failed -> sent`, optionally recording the answered inbound id.
    async fn mark_sent(
        &self,
        id: &str,
        inbound_id: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<bool>;
    /// `pending -> failed`.
    async fn mark_failed(&self, id: &str, error: &str) -> Result<bool>;
    /// Pending messages for the conversation, oldest first.
    async fn find_pending(
        &self,
        account_id: &str,
        conversation_key: &str,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>>;
    async fn count_for_account(
        &self,
        account_id: &str,
        since: Option<OffsetDateTime>,
    ) -> Result<u64>;
    async fn count_failed(&self, account_id: Option<&str>) -> Result<u64>;
    /// Every reply of the tenant, newest first.
    async fn list_for_account(
        &self,
        account_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<OutboundMessage>>;
    /// Failed replies of the tenant, newest first.
    async fn find_failed(&self, account_id: &str, limit: usize) -> Result<Vec<OutboundMessage>>;
}

pub type SharedAccountRepository = Arc<dyn AccountRepository>;
pub type SharedSessionRepository = Arc<dyn SessionRepository>;
pub type SharedConversationRepository = Arc<dyn ConversationRepository>;
pub type SharedInboundRepository = Arc<dyn InboundRepository>;
pub type SharedOutboundRepository = Arc<dyn OutboundRepository>;

/// One handle per repository, all backed by the same store.
#[derive(Clone)]
pub struct Repositories {
    pub accounts: SharedAccountRepository,
    pub sessions: SharedSessionRepository,
    pub conversations: SharedConversationRepository,
    pub inbound: SharedInboundRepository,
    pub outbound: SharedOutboundRepository,
}

impl Repositories {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: AccountRepository
            + SessionRepository
            + ConversationRepository
            + InboundRepository
            + OutboundRepository
            + 'static,
    {
        Self {
            accounts: store.clone(),
            sessions: store.clone(),
            conversations: store.clone(),
            inbound: store.clone(),
            outbound: store,
        }
    }

    pub fn memory() -> Self {
        Self::from_store(Arc::new(MemoryStore::new()))
    }

    #[cfg(feature = "sqlite")]
    pub fn sqlite(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        Ok(Self::from_store(Arc::new(SqliteStore::open(path)?)))
    }
}
