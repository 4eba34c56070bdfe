use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Fresh random identifier used for every persisted row.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownStatus(other.to_string())),
                }
            }
        }
    };
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown status `{0}`")]
pub struct UnknownStatus(pub String);

status_enum! {
    /// Lifecycle of a pairing session.
    SessionStatus {
        PendingPairing => "pending_pairing",
        Paired => "paired",
        Disconnected => "disconnected",
        Expired => "expired",
    }
}

status_enum! {
    MappingState {
        Paired => "paired",
        Unpaired => "unpaired",
    }
}

status_enum! {
    /// Delivery state of a chat event waiting for a consumer.
    InboundStatus {
        Queued => "queued",
        Delivered => "delivered",
        Acked => "acked",
        Expired => "expired",
    }
}

impl InboundStatus {
    /// A reply can still be matched to the event.
    pub fn awaits_reply(&self) -> bool {
        matches!(self, Self::Queued | Self::Delivered)
    }
}

status_enum! {
    OutboundStatus {
        Pending => "pending",
        Sent => "sent",
        Failed => "failed",
    }
}

/// Tenant owning one consumer connection and its conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default, skip_serializing)]
    pub relay_token_hash: Option<String>,
    pub rate_limit_per_minute: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Account {
    pub fn new(relay_token_hash: Option<String>, rate_limit_per_minute: u32, now: OffsetDateTime) -> Self {
        Self {
            id: new_id(),
            relay_token_hash,
            rate_limit_per_minute,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing)]
    pub token_hash: String,
    pub pairing_code: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub paired_at: Option<OffsetDateTime>,
}

impl Session {
    pub fn is_pairable_at(&self, now: OffsetDateTime) -> bool {
        self.status == SessionStatus::PendingPairing && self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMapping {
    pub id: String,
    pub conversation_key: String,
    pub account_id: String,
    pub state: MappingState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub account_id: String,
    pub conversation_key: String,
    pub platform_payload: Value,
    pub normalized_payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub callback_expires_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<String>,
    pub status: InboundStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub delivered_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub acked_at: Option<OffsetDateTime>,
}

impl InboundMessage {
    /// True while a late reply can still be pushed to the platform callback.
    pub fn callback_open_at(&self, now: OffsetDateTime) -> bool {
        self.callback_url.is_some() && self.callback_expires_at.is_some_and(|at| at > now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: String,
    pub account_id: String,
    pub conversation_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_id: Option<String>,
    pub payload: Value,
    pub status: OutboundStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub sent_at: Option<OffsetDateTime>,
}

/// Per-tenant traffic summary rendered by the `/status` chat command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickStats {
    pub inbound_today: u64,
    pub inbound_total: u64,
    pub outbound_today: u64,
    pub outbound_total: u64,
    pub outbound_failed: u64,
}

/// Relay-wide counters for the admin overview.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverviewStats {
    pub accounts: u64,
    pub sessions_pending: u64,
    pub sessions_paired: u64,
    pub inbound_queued: u64,
    pub outbound_failed: u64,
    pub connected_clients: u64,
}
