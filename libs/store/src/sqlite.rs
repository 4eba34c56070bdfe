use std::{
    path::Path,
    sync::{Arc, Mutex as StdMutex},
};

use async_trait::async_trait;
use relay_core::{
    Account, ConversationMapping, InboundMessage, InboundStatus, OutboundMessage, Session,
    SessionStatus, new_id,
};
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, Transaction, params, types::Type,
};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;

use crate::{
    AccountRepository, ConversationRepository, InboundRepository, Inserted, OutboundRepository,
    PairingClaim, Result, SessionRepository, StoreError,
};

const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    relay_token_hash TEXT UNIQUE,
    rate_limit_per_minute INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    token_hash TEXT NOT NULL UNIQUE,
    pairing_code TEXT NOT NULL,
    status TEXT NOT NULL,
    account_id TEXT,
    conversation_key TEXT,
    metadata TEXT,
    client_ip TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    paired_at INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS sessions_pending_code
    ON sessions (pairing_code) WHERE status = 'pending_pairing';
CREATE INDEX IF NOT EXISTS sessions_conversation ON sessions (conversation_key);
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    conversation_key TEXT NOT NULL UNIQUE,
    account_id TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_message_at INTEGER
);
CREATE TABLE IF NOT EXISTS inbound_messages (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    conversation_key TEXT NOT NULL,
    platform_payload TEXT NOT NULL,
    normalized_payload TEXT NOT NULL,
    callback_url TEXT,
    callback_expires_at INTEGER,
    source_event_id TEXT,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    delivered_at INTEGER,
    acked_at INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS inbound_source_event
    ON inbound_messages (account_id, source_event_id) WHERE source_event_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS inbound_queue ON inbound_messages (account_id, status);
CREATE TABLE IF NOT EXISTS outbound_messages (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    conversation_key TEXT NOT NULL,
    inbound_id TEXT,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    sent_at INTEGER
);
CREATE INDEX IF NOT EXISTS outbound_pending
    ON outbound_messages (account_id, conversation_key, status);
"#;

const SESSION_COLUMNS: &str = "id, token_hash, pairing_code, status, account_id, conversation_key, \
     metadata, client_ip, created_at, expires_at, paired_at";
const ACCOUNT_COLUMNS: &str =
    "id, relay_token_hash, rate_limit_per_minute, created_at, updated_at";
const MAPPING_COLUMNS: &str =
    "id, conversation_key, account_id, state, created_at, updated_at, last_message_at";
const INBOUND_COLUMNS: &str = "id, account_id, conversation_key, platform_payload, \
     normalized_payload, callback_url, callback_expires_at, source_event_id, status, created_at, \
     expires_at, delivered_at, acked_at";
const OUTBOUND_COLUMNS: &str = "id, account_id, conversation_key, inbound_id, payload, status, \
     error_message, created_at, sent_at";

/// SQLite-backed store. All statements run on the blocking pool behind one connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<StdMutex<Connection>>,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(msg.clone().unwrap_or_else(|| "constraint".into()))
            }
            _ => StoreError::Internal(err.into()),
        }
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(CREATE_TABLES_SQL)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, func: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            func(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Internal(err.into()))?
    }
}

fn millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

fn opt_millis(at: Option<OffsetDateTime>) -> Option<i64> {
    at.map(millis)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(err))
}

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let ms: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|err| conversion_error(idx, err))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    let ms: Option<i64> = row.get(idx)?;
    ms.map(|ms| {
        OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
            .map_err(|err| conversion_error(idx, err))
    })
    .transpose()
}

fn json(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|err| conversion_error(idx, err))
}

fn status<S>(row: &Row<'_>, idx: usize) -> rusqlite::Result<S>
where
    S: std::str::FromStr<Err = relay_core::model::UnknownStatus>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|err| conversion_error(idx, err))
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        relay_token_hash: row.get(1)?,
        rate_limit_per_minute: row.get(2)?,
        created_at: ts(row, 3)?,
        updated_at: ts(row, 4)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let metadata: Option<String> = row.get(6)?;
    Ok(Session {
        id: row.get(0)?,
        token_hash: row.get(1)?,
        pairing_code: row.get(2)?,
        status: status(row, 3)?,
        account_id: row.get(4)?,
        conversation_key: row.get(5)?,
        metadata: metadata
            .map(|raw| serde_json::from_str(&raw).map_err(|err| conversion_error(6, err)))
            .transpose()?,
        client_ip: row.get(7)?,
        created_at: ts(row, 8)?,
        expires_at: ts(row, 9)?,
        paired_at: opt_ts(row, 10)?,
    })
}

fn mapping_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationMapping> {
    Ok(ConversationMapping {
        id: row.get(0)?,
        conversation_key: row.get(1)?,
        account_id: row.get(2)?,
        state: status(row, 3)?,
        created_at: ts(row, 4)?,
        updated_at: ts(row, 5)?,
        last_message_at: opt_ts(row, 6)?,
    })
}

fn inbound_from_row(row: &Row<'_>) -> rusqlite::Result<InboundMessage> {
    Ok(InboundMessage {
        id: row.get(0)?,
        account_id: row.get(1)?,
        conversation_key: row.get(2)?,
        platform_payload: json(row, 3)?,
        normalized_payload: json(row, 4)?,
        callback_url: row.get(5)?,
        callback_expires_at: opt_ts(row, 6)?,
        source_event_id: row.get(7)?,
        status: status(row, 8)?,
        created_at: ts(row, 9)?,
        expires_at: ts(row, 10)?,
        delivered_at: opt_ts(row, 11)?,
        acked_at: opt_ts(row, 12)?,
    })
}

fn outbound_from_row(row: &Row<'_>) -> rusqlite::Result<OutboundMessage> {
    Ok(OutboundMessage {
        id: row.get(0)?,
        account_id: row.get(1)?,
        conversation_key: row.get(2)?,
        inbound_id: row.get(3)?,
        payload: json(row, 4)?,
        status: status(row, 5)?,
        error_message: row.get(6)?,
        created_at: ts(row, 7)?,
        sent_at: opt_ts(row, 8)?,
    })
}

fn to_json(value: &Value) -> Result<String> {
    serde_json::to_string(value).map_err(|err| StoreError::Internal(err.into()))
}

fn unpair_conversation(
    tx: &Transaction<'_>,
    conversation_key: &str,
    account_id: &str,
    now: OffsetDateTime,
) -> rusqlite::Result<usize> {
    tx.execute(
        "UPDATE conversations SET state = 'unpaired', updated_at = ?3
         WHERE conversation_key = ?1 AND account_id = ?2",
        params![conversation_key, account_id, millis(now)],
    )
}

#[async_trait]
impl AccountRepository for SqliteStore {
    async fn insert(&self, account: Account) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO accounts (id, relay_token_hash, rate_limit_per_minute, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    account.id,
                    account.relay_token_hash,
                    account.rate_limit_per_minute,
                    millis(account.created_at),
                    millis(account.updated_at)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Account>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1");
            Ok(conn
                .query_row(&sql, params![id], account_from_row)
                .optional()?)
        })
        .await
    }

    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<Account>> {
        let hash = token_hash.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE relay_token_hash = ?1");
            Ok(conn
                .query_row(&sql, params![hash], account_from_row)
                .optional()?)
        })
        .await
    }

    async fn set_token_hash(
        &self,
        id: &str,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let (id, hash) = (id.to_string(), token_hash.to_string());
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE accounts SET relay_token_hash = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, hash, millis(now)],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn set_rate_limit(&self, id: &str, per_minute: u32, now: OffsetDateTime) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE accounts SET rate_limit_per_minute = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, per_minute, millis(now)],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for table in ["sessions", "conversations", "inbound_messages", "outbound_messages"] {
                tx.execute(
                    &format!("DELETE FROM {table} WHERE account_id = ?1"),
                    params![id],
                )?;
            }
            let n = tx.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(n > 0)
        })
        .await
    }

    async fn count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
            Ok(n as u64)
        })
        .await
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Account>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {ACCOUNT_COLUMNS} FROM accounts
                 ORDER BY created_at DESC, id LIMIT ?1 OFFSET ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit as i64, offset as i64], account_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

#[async_trait]
impl SessionRepository for SqliteStore {
    async fn insert(&self, session: Session) -> Result<()> {
        let metadata = session.metadata.as_ref().map(to_json).transpose()?;
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO sessions ({SESSION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    session.id,
                    session.token_hash,
                    session.pairing_code,
                    session.status.as_str(),
                    session.account_id,
                    session.conversation_key,
                    metadata,
                    session.client_ip,
                    millis(session.created_at),
                    millis(session.expires_at),
                    opt_millis(session.paired_at)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
            Ok(conn
                .query_row(&sql, params![id], session_from_row)
                .optional()?)
        })
        .await
    }

    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>> {
        let hash = token_hash.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE token_hash = ?1");
            Ok(conn
                .query_row(&sql, params![hash], session_from_row)
                .optional()?)
        })
        .await
    }

    async fn find_by_pairing_code(&self, code: &str) -> Result<Option<Session>> {
        let code = code.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE pairing_code = ?1
                 ORDER BY rowid DESC LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![code], session_from_row)
                .optional()?)
        })
        .await
    }

    async fn find_by_conversation(&self, conversation_key: &str) -> Result<Option<Session>> {
        let key = conversation_key.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE conversation_key = ?1
                 ORDER BY paired_at DESC, rowid DESC LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![key], session_from_row)
                .optional()?)
        })
        .await
    }

    async fn claim_pairing(&self, claim: PairingClaim) -> Result<Option<Session>> {
        self.with_conn(move |conn| {
            let now = millis(claim.now);
            let tx = conn.transaction()?;
            let claimed = tx
                .query_row(
                    "UPDATE sessions SET status = 'paired', paired_at = ?2, conversation_key = ?3
                     WHERE pairing_code = ?1 AND status = 'pending_pairing' AND expires_at > ?2
                     RETURNING id, token_hash, account_id",
                    params![claim.pairing_code, now, claim.conversation_key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    },
                )
                .optional()?;
            let Some((session_id, token_hash, account_id)) = claimed else {
                return Ok(None);
            };

            let account_id = match account_id {
                Some(id) => id,
                None => {
                    let account = Account::new(
                        Some(token_hash),
                        claim.default_rate_limit_per_minute,
                        claim.now,
                    );
                    tx.execute(
                        "INSERT INTO accounts (id, relay_token_hash, rate_limit_per_minute, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?4)",
                        params![
                            account.id,
                            account.relay_token_hash,
                            account.rate_limit_per_minute,
                            now
                        ],
                    )?;
                    tx.execute(
                        "UPDATE sessions SET account_id = ?2 WHERE id = ?1",
                        params![session_id, account.id],
                    )?;
                    account.id
                }
            };

            tx.execute(
                "UPDATE sessions SET status = 'disconnected'
                 WHERE conversation_key = ?1 AND status = 'paired' AND id != ?2",
                params![claim.conversation_key, session_id],
            )?;
            tx.execute(
                "INSERT INTO conversations (id, conversation_key, account_id, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'paired', ?4, ?4)
                 ON CONFLICT(conversation_key) DO UPDATE SET account_id = excluded.account_id,
                 state = 'paired', updated_at = excluded.updated_at",
                params![new_id(), claim.conversation_key, account_id, now],
            )?;

            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
            let session = tx.query_row(&sql, params![session_id], session_from_row)?;
            tx.commit()?;
            Ok(Some(session))
        })
        .await
    }

    async fn mark_disconnected(&self, id: &str, now: OffsetDateTime) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let binding = tx
                .query_row(
                    "UPDATE sessions SET status = 'disconnected'
                     WHERE id = ?1 AND status = 'paired'
                     RETURNING conversation_key, account_id",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, Option<String>>(1)?,
                        ))
                    },
                )
                .optional()?;
            let Some((conversation_key, account_id)) = binding else {
                return Ok(false);
            };
            if let (Some(key), Some(account)) = (conversation_key, account_id) {
                unpair_conversation(&tx, &key, &account, now)?;
            }
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn update_metadata(&self, id: &str, metadata: Value) -> Result<bool> {
        let id = id.to_string();
        let raw = to_json(&metadata)?;
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE sessions SET metadata = ?2 WHERE id = ?1",
                params![id, raw],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn delete(&self, id: &str, now: OffsetDateTime) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx
                .query_row(
                    "DELETE FROM sessions WHERE id = ?1 RETURNING status, conversation_key, account_id",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    },
                )
                .optional()?;
            let Some((status, conversation_key, account_id)) = removed else {
                return Ok(false);
            };
            if status == SessionStatus::Paired.as_str() {
                if let (Some(key), Some(account)) = (conversation_key, account_id) {
                    unpair_conversation(&tx, &key, &account, now)?;
                }
            }
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn expire_pending(&self, now: OffsetDateTime) -> Result<u64> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE sessions SET status = 'expired'
                 WHERE status = 'pending_pairing' AND expires_at <= ?1",
                params![millis(now)],
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn find_recent(&self, limit: usize) -> Result<Vec<Session>> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY rowid DESC LIMIT ?1");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit as i64], session_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn count_by_status(&self, status: SessionStatus) -> Result<u64> {
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }
}

#[async_trait]
impl ConversationRepository for SqliteStore {
    async fn get(&self, conversation_key: &str) -> Result<Option<ConversationMapping>> {
        let key = conversation_key.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {MAPPING_COLUMNS} FROM conversations WHERE conversation_key = ?1");
            Ok(conn
                .query_row(&sql, params![key], mapping_from_row)
                .optional()?)
        })
        .await
    }

    async fn list_for_account(&self, account_id: &str) -> Result<Vec<ConversationMapping>> {
        let account_id = account_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {MAPPING_COLUMNS} FROM conversations WHERE account_id = ?1 ORDER BY created_at"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![account_id], mapping_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn touch(&self, conversation_key: &str, now: OffsetDateTime) -> Result<bool> {
        let key = conversation_key.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE conversations SET last_message_at = ?2, updated_at = ?2
                 WHERE conversation_key = ?1",
                params![key, millis(now)],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn delete(&self, conversation_key: &str) -> Result<bool> {
        let key = conversation_key.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM conversations WHERE conversation_key = ?1",
                params![key],
            )?;
            Ok(n > 0)
        })
        .await
    }
}

#[async_trait]
impl InboundRepository for SqliteStore {
    async fn insert(&self, message: InboundMessage) -> Result<Inserted<InboundMessage>> {
        let platform = to_json(&message.platform_payload)?;
        let normalized = to_json(&message.normalized_payload)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if let Some(source) = message.source_event_id.as_deref() {
                let sql = format!(
                    "SELECT {INBOUND_COLUMNS} FROM inbound_messages
                     WHERE account_id = ?1 AND source_event_id = ?2"
                );
                let existing = tx
                    .query_row(&sql, params![message.account_id, source], inbound_from_row)
                    .optional()?;
                if let Some(existing) = existing {
                    return Ok(Inserted {
                        record: existing,
                        created: false,
                    });
                }
            }
            tx.execute(
                &format!(
                    "INSERT INTO inbound_messages ({INBOUND_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    message.id,
                    message.account_id,
                    message.conversation_key,
                    platform,
                    normalized,
                    message.callback_url,
                    opt_millis(message.callback_expires_at),
                    message.source_event_id,
                    message.status.as_str(),
                    millis(message.created_at),
                    millis(message.expires_at),
                    opt_millis(message.delivered_at),
                    opt_millis(message.acked_at)
                ],
            )?;
            tx.commit()?;
            Ok(Inserted {
                record: message,
                created: true,
            })
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<InboundMessage>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {INBOUND_COLUMNS} FROM inbound_messages WHERE id = ?1");
            Ok(conn
                .query_row(&sql, params![id], inbound_from_row)
                .optional()?)
        })
        .await
    }

    async fn mark_delivered(&self, id: &str, now: OffsetDateTime) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE inbound_messages SET status = 'delivered', delivered_at = ?2
                 WHERE id = ?1 AND status = 'queued'",
                params![id, millis(now)],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn mark_acked(&self, id: &str, now: OffsetDateTime) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE inbound_messages SET status = 'acked', acked_at = ?2
                 WHERE id = ?1 AND status IN ('queued', 'delivered')",
                params![id, millis(now)],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn find_queued(&self, account_id: &str, limit: usize) -> Result<Vec<InboundMessage>> {
        let account_id = account_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {INBOUND_COLUMNS} FROM inbound_messages
                 WHERE account_id = ?1 AND status = 'queued'
                 ORDER BY created_at, rowid LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![account_id, limit as i64], inbound_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn expire_stale(&self, now: OffsetDateTime) -> Result<u64> {
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE inbound_messages SET status = 'expired'
                 WHERE status = 'queued'
                 AND (expires_at <= ?1 OR (callback_expires_at IS NOT NULL AND callback_expires_at <= ?1))",
                params![millis(now)],
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn count_for_account(
        &self,
        account_id: &str,
        since: Option<OffsetDateTime>,
    ) -> Result<u64> {
        let account_id = account_id.to_string();
        let since = since.map(millis).unwrap_or(i64::MIN);
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM inbound_messages WHERE account_id = ?1 AND created_at >= ?2",
                params![account_id, since],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn count_by_status(&self, status: InboundStatus) -> Result<u64> {
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM inbound_messages WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn list_for_account(
        &self,
        account_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<InboundMessage>> {
        let account_id = account_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {INBOUND_COLUMNS} FROM inbound_messages WHERE account_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![account_id, limit as i64, offset as i64],
                inbound_from_row,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

#[async_trait]
impl OutboundRepository for SqliteStore {
    async fn insert(&self, message: OutboundMessage) -> Result<()> {
        let payload = to_json(&message.payload)?;
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO outbound_messages ({OUTBOUND_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    message.id,
                    message.account_id,
                    message.conversation_key,
                    message.inbound_id,
                    payload,
                    message.status.as_str(),
                    message.error_message,
                    millis(message.created_at),
                    opt_millis(message.sent_at)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<OutboundMessage>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {OUTBOUND_COLUMNS} FROM outbound_messages WHERE id = ?1");
            Ok(conn
                .query_row(&sql, params![id], outbound_from_row)
                .optional()?)
        })
        .await
    }

    async fn mark_sent(
        &self,
        id: &str,
        inbound_id: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let id = id.to_string();
        let inbound_id = inbound_id.map(str::to_string);
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE outbound_messages
                 SET status = 'sent', sent_at = ?2, error_message = NULL,
                     inbound_id = COALESCE(?3, inbound_id)
                 WHERE id = ?1 AND status != 'sent'",
                params![id, millis(now), inbound_id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<bool> {
        let (id, error) = (id.to_string(), error.to_string());
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE outbound_messages SET status = 'failed', error_message = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, error],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn find_pending(
        &self,
        account_id: &str,
        conversation_key: &str,
        limit: usize,
    ) -> Result<Vec<OutboundMessage>> {
        let (account_id, key) = (account_id.to_string(), conversation_key.to_string());
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {OUTBOUND_COLUMNS} FROM outbound_messages
                 WHERE account_id = ?1 AND conversation_key = ?2 AND status = 'pending'
                 ORDER BY created_at, rowid LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![account_id, key, limit as i64], outbound_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn count_for_account(
        &self,
        account_id: &str,
        since: Option<OffsetDateTime>,
    ) -> Result<u64> {
        let account_id = account_id.to_string();
        let since = since.map(millis).unwrap_or(i64::MIN);
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM outbound_messages WHERE account_id = ?1 AND created_at >= ?2",
                params![account_id, since],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn count_failed(&self, account_id: Option<&str>) -> Result<u64> {
        let account_id = account_id.map(str::to_string);
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM outbound_messages
                 WHERE status = 'failed' AND (?1 IS NULL OR account_id = ?1)",
                params![account_id],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn list_for_account(
        &self,
        account_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<OutboundMessage>> {
        let account_id = account_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {OUTBOUND_COLUMNS} FROM outbound_messages WHERE account_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![account_id, limit as i64, offset as i64],
                outbound_from_row,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn find_failed(&self, account_id: &str, limit: usize) -> Result<Vec<OutboundMessage>> {
        let account_id = account_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {OUTBOUND_COLUMNS} FROM outbound_messages
                 WHERE account_id = ?1 AND status = 'failed'
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![account_id, limit as i64], outbound_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{InboundStatus, OutboundStatus, SessionStatus};
    use time::macros::datetime;

    fn session(code: &str, token_hash: &str, now: OffsetDateTime) -> Session {
        Session {
            id: new_id(),
            token_hash: token_hash.into(),
            pairing_code: code.into(),
            status: SessionStatus::PendingPairing,
            account_id: None,
            conversation_key: None,
            metadata: None,
            client_ip: Some("10.0.0.1".into()),
            created_at: now,
            expires_at: now + time::Duration::minutes(10),
            paired_at: None,
        }
    }

    #[tokio::test]
    async fn pending_codes_are_unique() {
        let store = SqliteStore::in_memory().unwrap();
        let now = datetime!(2024-05-01 10:00 UTC);
        SessionRepository::insert(&store, session("ABCD-1234", "h1", now))
            .await
            .unwrap();
        let err = SessionRepository::insert(&store, session("ABCD-1234", "h2", now))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn claim_provisions_account_and_mapping() {
        let store = SqliteStore::in_memory().unwrap();
        let now = datetime!(2024-05-01 10:00 UTC);
        SessionRepository::insert(&store, session("ABCD-1234", "h1", now))
            .await
            .unwrap();
        let claim = PairingClaim {
            pairing_code: "ABCD-1234".into(),
            conversation_key: "conv-42".into(),
            default_rate_limit_per_minute: 60,
            now,
        };
        let paired = store.claim_pairing(claim.clone()).await.unwrap().unwrap();
        assert_eq!(paired.status, SessionStatus::Paired);
        let account_id = paired.account_id.clone().unwrap();
        let account = AccountRepository::get(&store, &account_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.relay_token_hash.as_deref(), Some("h1"));
        let mapping = ConversationRepository::get(&store, "conv-42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.account_id, account_id);
        assert!(store.claim_pairing(claim).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inbound_dedupes_on_source_event() {
        let store = SqliteStore::in_memory().unwrap();
        let now = datetime!(2024-05-01 10:00 UTC);
        let msg = InboundMessage {
            id: new_id(),
            account_id: "acc".into(),
            conversation_key: "conv".into(),
            platform_payload: serde_json::json!({"raw": true}),
            normalized_payload: serde_json::json!({"text": "hi"}),
            callback_url: None,
            callback_expires_at: None,
            source_event_id: Some("evt-1".into()),
            status: InboundStatus::Queued,
            created_at: now,
            expires_at: now + time::Duration::minutes(15),
            delivered_at: None,
            acked_at: None,
        };
        let first = InboundRepository::insert(&store, msg.clone()).await.unwrap();
        assert!(first.created);
        let mut again = msg.clone();
        again.id = new_id();
        let second = InboundRepository::insert(&store, again).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.record.id, msg.id);
    }

    #[tokio::test]
    async fn tenant_listings_are_newest_first() {
        let store = SqliteStore::in_memory().unwrap();
        let start = datetime!(2024-05-01 10:00 UTC);
        for n in 0..3i64 {
            let at = start + time::Duration::minutes(n);
            let reply = OutboundMessage {
                id: format!("out-{n}"),
                account_id: "acc".into(),
                conversation_key: "conv".into(),
                inbound_id: None,
                payload: serde_json::json!({"n": n}),
                status: OutboundStatus::Pending,
                error_message: None,
                created_at: at,
                sent_at: None,
            };
            OutboundRepository::insert(&store, reply).await.unwrap();
        }
        store.mark_failed("out-0", "timeout").await.unwrap();
        store.mark_failed("out-2", "timeout").await.unwrap();

        let page = OutboundRepository::list_for_account(&store, "acc", 2, 1)
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["out-1", "out-0"]);
        let failed = store.find_failed("acc", 10).await.unwrap();
        let ids: Vec<_> = failed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["out-2", "out-0"]);
        assert!(store.find_failed("other", 10).await.unwrap().is_empty());

        for n in 0..2i64 {
            let account = Account::new(None, 30, start + time::Duration::minutes(n));
            AccountRepository::insert(&store, account).await.unwrap();
        }
        let accounts = store.list(10, 0).await.unwrap();
        assert_eq!(accounts.len(), 2);
        assert!(accounts[0].created_at > accounts[1].created_at);
        assert!(store.list(10, 2).await.unwrap().is_empty());
    }
}
