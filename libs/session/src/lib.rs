//! Session pairing and tenant identity.
//!
//! A consumer asks for a session and receives a one-time bearer token plus a short pairing
//! code. A human types the code into the chat conversation; the webhook then calls
//! [`SessionManager::pair`], which binds the conversation to the session's tenant. The
//! state machine is `pending_pairing -> paired -> disconnected`, with `pending_pairing ->
//! expired` done by the reaper. There is no way back from `disconnected` or `expired`.

use std::time::Duration;

use relay_broker::{BrokerMessage, EventBroker};
use relay_core::{
    Account, RelayError, Result, Session, SessionStatus, SharedClock, TokenHasher,
    generate_pairing_code, generate_token, mask_code, new_id, normalize_pairing_code,
    system_clock,
};
use relay_ratelimit::{RateKey, RateLimiter};
use relay_store::{
    PairingClaim, Repositories, SharedAccountRepository, SharedConversationRepository,
    SharedSessionRepository, StoreError,
};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

pub const PAIRING_COMPLETE_EVENT: &str = "pairing_complete";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub pairing_ttl: Duration,
    pub create_limit: u32,
    pub create_window: Duration,
    pub default_rate_limit_per_minute: u32,
    pub max_code_attempts: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pairing_ttl: Duration::from_secs(10 * 60),
            create_limit: 10,
            create_window: Duration::from_secs(5 * 60),
            default_rate_limit_per_minute: 60,
            max_code_attempts: 5,
        }
    }
}

/// Returned once at creation; the plaintext token is never stored.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session: Session,
    pub token: String,
}

#[derive(Debug, Clone, Copy)]
pub enum SessionLookup<'a> {
    Token(&'a str),
    Conversation(&'a str),
}

/// Who a bearer credential belongs to.
#[derive(Debug, Clone)]
pub enum Principal {
    Account {
        account: Account,
        session: Option<Session>,
    },
    /// Session still waiting for its code to be entered.
    PendingSession(Session),
}

#[derive(Clone)]
pub struct SessionManager {
    sessions: SharedSessionRepository,
    accounts: SharedAccountRepository,
    conversations: SharedConversationRepository,
    limiter: RateLimiter,
    broker: Option<EventBroker>,
    hasher: TokenHasher,
    clock: SharedClock,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        repos: &Repositories,
        limiter: RateLimiter,
        hasher: TokenHasher,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: repos.sessions.clone(),
            accounts: repos.accounts.clone(),
            conversations: repos.conversations.clone(),
            limiter,
            broker: None,
            hasher,
            clock: system_clock(),
            config,
        }
    }

    pub fn with_broker(mut self, broker: EventBroker) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn hasher(&self) -> &TokenHasher {
        &self.hasher
    }

    /// Broker channel a pending session's consumer listens on for its pairing notice.
    pub fn pairing_channel(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    #[instrument(name = "session.create", skip(self))]
    pub async fn create_session(&self, client_ip: &str) -> Result<CreatedSession> {
        self.limiter
            .enforce(
                &RateKey::ip("session_create", client_ip),
                self.config.create_limit,
                self.config.create_window,
            )
            .await?;

        let now = self.clock.now();
        for attempt in 1..=self.config.max_code_attempts {
            let token = generate_token();
            let session = Session {
                id: new_id(),
                token_hash: self.hasher.hash(&token),
                pairing_code: generate_pairing_code(),
                status: SessionStatus::PendingPairing,
                account_id: None,
                conversation_key: None,
                metadata: None,
                client_ip: Some(client_ip.to_string()),
                created_at: now,
                expires_at: now + self.config.pairing_ttl,
                paired_at: None,
            };
            match self.sessions.insert(session.clone()).await {
                Ok(()) => {
                    info!(
                        session_id = %session.id,
                        code = %mask_code(&session.pairing_code),
                        "pairing session created"
                    );
                    return Ok(CreatedSession { session, token });
                }
                Err(StoreError::Conflict(_)) => {
                    warn!(attempt, "pairing code collision, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(RelayError::storage(anyhow::anyhow!(
            "no free pairing code after {} attempts",
            self.config.max_code_attempts
        )))
    }

    #[instrument(name = "session.pair", skip(self, pairing_code))]
    pub async fn pair(&self, pairing_code: &str, conversation_key: &str) -> Result<Session> {
        let code = normalize_pairing_code(pairing_code)
            .ok_or_else(|| RelayError::not_found("pairing code"))?;
        let now = self.clock.now();
        let claim = PairingClaim {
            pairing_code: code.clone(),
            conversation_key: conversation_key.to_string(),
            default_rate_limit_per_minute: self.config.default_rate_limit_per_minute,
            now,
        };

        if let Some(session) = self.sessions.claim_pairing(claim).await? {
            info!(
                session_id = %session.id,
                account_id = session.account_id.as_deref().unwrap_or_default(),
                "session paired"
            );
            self.notify_paired(&session).await;
            return Ok(session);
        }

        let existing = self.sessions.find_by_pairing_code(&code).await?;
        Err(match existing {
            None => RelayError::not_found("pairing code"),
            Some(session) => match session.status {
                SessionStatus::Paired | SessionStatus::Disconnected => RelayError::AlreadyPaired,
                SessionStatus::Expired => RelayError::Expired,
                SessionStatus::PendingPairing if session.expires_at <= now => RelayError::Expired,
                SessionStatus::PendingPairing => RelayError::not_found("pairing code"),
            },
        })
    }

    async fn notify_paired(&self, session: &Session) {
        let Some(broker) = &self.broker else {
            return;
        };
        let message = BrokerMessage::new(
            PAIRING_COMPLETE_EVENT,
            json!({
                "sessionId": session.id,
                "accountId": session.account_id,
                "conversationKey": session.conversation_key,
            }),
        );
        if let Err(err) = broker
            .publish(&Self::pairing_channel(&session.id), message)
            .await
        {
            warn!(error = %err, session_id = %session.id, "failed to publish pairing notice");
        }
    }

    /// Paired session for a consumer token or a chat conversation.
    pub async fn resolve(&self, lookup: SessionLookup<'_>) -> Result<Session> {
        let found = match lookup {
            SessionLookup::Token(token) => {
                self.sessions
                    .find_by_token_hash(&self.hasher.hash(token))
                    .await?
            }
            SessionLookup::Conversation(key) => self.sessions.find_by_conversation(key).await?,
        };
        match found {
            Some(session) => match session.status {
                SessionStatus::Paired => Ok(session),
                SessionStatus::Disconnected => Err(RelayError::Disconnected),
                SessionStatus::Expired => Err(RelayError::Expired),
                SessionStatus::PendingPairing => Err(RelayError::not_found("session")),
            },
            None => Err(RelayError::not_found("session")),
        }
    }

    /// Any-status lookup backing the pairing status poll.
    pub async fn status(&self, token: &str) -> Result<Session> {
        self.sessions
            .find_by_token_hash(&self.hasher.hash(token))
            .await?
            .ok_or_else(|| RelayError::not_found("session"))
    }

    /// Resolves a bearer credential: a session token, or an account token after rotation.
    pub async fn authenticate(&self, token: &str) -> Result<Principal> {
        let hash = self.hasher.hash(token);
        if let Some(session) = self.sessions.find_by_token_hash(&hash).await? {
            return match session.status {
                SessionStatus::PendingPairing if session.expires_at > self.clock.now() => {
                    Ok(Principal::PendingSession(session))
                }
                SessionStatus::PendingPairing | SessionStatus::Expired => Err(RelayError::Expired),
                SessionStatus::Disconnected => Err(RelayError::Disconnected),
                SessionStatus::Paired => {
                    let account_id = session
                        .account_id
                        .as_deref()
                        .ok_or_else(|| RelayError::not_found("account"))?;
                    let account = self
                        .accounts
                        .get(account_id)
                        .await?
                        .ok_or_else(|| RelayError::not_found("account"))?;
                    // A rotated account token retires the session token.
                    if account.relay_token_hash.as_deref() != Some(hash.as_str()) {
                        return Err(RelayError::not_found("credential"));
                    }
                    Ok(Principal::Account {
                        account,
                        session: Some(session),
                    })
                }
            };
        }
        self.accounts
            .find_by_token_hash(&hash)
            .await?
            .map(|account| Principal::Account {
                account,
                session: None,
            })
            .ok_or_else(|| RelayError::not_found("credential"))
    }

    #[instrument(name = "session.disconnect", skip(self))]
    pub async fn disconnect(&self, session_id: &str) -> Result<()> {
        if self
            .sessions
            .mark_disconnected(session_id, self.clock.now())
            .await?
        {
            info!("session disconnected");
            Ok(())
        } else {
            Err(RelayError::not_found("paired session"))
        }
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        if self.sessions.delete(session_id, self.clock.now()).await? {
            info!(session_id, "session deleted");
            Ok(())
        } else {
            Err(RelayError::not_found("session"))
        }
    }

    pub async fn find_recent(&self, limit: usize) -> Result<Vec<Session>> {
        Ok(self.sessions.find_recent(limit).await?)
    }

    pub async fn update_metadata(&self, session_id: &str, metadata: Value) -> Result<()> {
        if self.sessions.update_metadata(session_id, metadata).await? {
            Ok(())
        } else {
            Err(RelayError::not_found("session"))
        }
    }

    /// Issues a fresh account token. The old one, and the pairing session token, stop working.
    pub async fn regenerate_token(&self, account_id: &str) -> Result<String> {
        let token = generate_token();
        let updated = self
            .accounts
            .set_token_hash(account_id, &self.hasher.hash(&token), self.clock.now())
            .await?;
        if !updated {
            return Err(RelayError::not_found("account"));
        }
        info!(account_id, "account token rotated");
        Ok(token)
    }

    /// Removes one of the tenant's conversations. A session still paired to it is
    /// disconnected first, so the chat stops relaying.
    pub async fn forget_conversation(&self, account_id: &str, conversation_key: &str) -> Result<()> {
        let owned = self
            .conversations
            .get(conversation_key)
            .await?
            .is_some_and(|mapping| mapping.account_id == account_id);
        if !owned {
            return Err(RelayError::not_found("conversation"));
        }
        if let Some(session) = self.sessions.find_by_conversation(conversation_key).await? {
            if session.status == SessionStatus::Paired
                && session.account_id.as_deref() == Some(account_id)
            {
                self.sessions
                    .mark_disconnected(&session.id, self.clock.now())
                    .await?;
            }
        }
        self.conversations.delete(conversation_key).await?;
        info!(account_id, conversation_key, "conversation removed");
        Ok(())
    }

    pub async fn delete_account(&self, account_id: &str) -> Result<()> {
        if self.accounts.delete(account_id).await? {
            info!(account_id, "account deleted");
            Ok(())
        } else {
            Err(RelayError::not_found("account"))
        }
    }
}
