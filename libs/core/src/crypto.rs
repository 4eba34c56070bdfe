//! Token, pairing-code and signature helpers.
//!
//! Tokens are never stored in plaintext: the store only sees the keyed hash produced by
//! [`TokenHasher`], so a leaked database cannot be replayed against the relay without the
//! server secret.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha2::Sha256;

use crate::error::{RelayError, Result};

type HmacSha256 = Hmac<Sha256>;

const TOKEN_BYTES: usize = 32;
const CODE_LETTERS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const CODE_DIGITS: &[u8] = b"0123456789";

/// Keyed SHA-256 hasher for bearer tokens.
#[derive(Clone)]
pub struct TokenHasher {
    mac: HmacSha256,
}

impl TokenHasher {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(RelayError::InvalidInput("token hash secret is empty".into()));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|err| RelayError::InvalidInput(format!("token hash secret: {err}")))?;
        Ok(Self { mac })
    }

    pub fn hash(&self, token: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(token.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for TokenHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenHasher").finish_non_exhaustive()
    }
}

/// 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    let mut buf = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Human-enterable code shaped like `ABCD-1234`.
pub fn generate_pairing_code() -> String {
    let mut rng = rand::rng();
    let mut code = String::with_capacity(9);
    for _ in 0..4 {
        code.push(CODE_LETTERS[rng.random_range(0..CODE_LETTERS.len())] as char);
    }
    code.push('-');
    for _ in 0..4 {
        code.push(CODE_DIGITS[rng.random_range(0..CODE_DIGITS.len())] as char);
    }
    code
}

/// Canonicalizes user-typed input into `AAAA-9999`, accepting lowercase and a missing dash.
pub fn normalize_pairing_code(input: &str) -> Option<String> {
    let compact: String = input
        .trim()
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if compact.len() != 8 {
        return None;
    }
    let (letters, digits) = compact.split_at(4);
    if !letters.chars().all(|c| c.is_ascii_uppercase()) || !digits.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    Some(format!("{letters}-{digits}"))
}

pub fn mask_code(code: &str) -> String {
    match code.get(..4) {
        Some(prefix) if code.len() > 4 => format!("{prefix}-****"),
        _ => "****".to_string(),
    }
}

/// Checks a base64 HMAC-SHA256 signature over `body`.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    let Ok(provided) = B64.decode(signature.trim()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}
