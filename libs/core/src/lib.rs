//! Shared contracts for the chat relay.
//!
//! This crate holds the value types persisted by the store, the error taxonomy surfaced by
//! every relay component, and the token and pairing-code helpers used during pairing and
//! consumer authentication.
pub mod clock;
pub mod crypto;
pub mod error;
pub mod model;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use crypto::{
    TokenHasher, generate_pairing_code, generate_token, mask_code, normalize_pairing_code,
    verify_signature,
};
pub use error::{RelayError, Result};
pub use model::*;
