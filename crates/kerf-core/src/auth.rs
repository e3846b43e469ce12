//! Bearer-token verification for the tunnel upgrade.
//!
//! The websocket URL carries `?token=<jwt>`. Tokens are HMAC-SHA256
//! JWTs signed with the shared secret, issuer "kerf", with a required
//! `exp` claim and an optional `subscribed` bool. Verification happens
//! before the upgrade completes; the verified claims become the
//! session's authorization snapshot, which the dispatcher re-checks on
//! every initiating request (tokens can expire mid-session).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Issuer every accepted token must carry.
pub const TOKEN_ISSUER: &str = "kerf";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    exp: u64,
    #[serde(default)]
    subscribed: Option<bool>,
}

/// Per-session authorization snapshot, taken at upgrade time.
#[derive(Debug, Clone, Copy)]
pub struct AuthSnapshot {
    pub subscribed: bool,
    pub token_expiry: Option<SystemTime>,
}

impl AuthSnapshot {
    /// Whether an initiating request may proceed. Subscribed sessions
    /// bypass the expiry check entirely.
    pub fn allows_request(&self, now: SystemTime) -> bool {
        self.subscribed || self.token_expiry.is_none_or(|expiry| expiry > now)
    }
}

/// Verify a token against the shared secret and extract the snapshot.
pub fn verify_token(token: &str, secret: &[u8]) -> Result<AuthSnapshot, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[TOKEN_ISSUER]);
    validation.set_required_spec_claims(&["exp", "iss"]);

    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;

    Ok(AuthSnapshot {
        subscribed: data.claims.subscribed.unwrap_or(false),
        token_expiry: Some(UNIX_EPOCH + Duration::from_secs(data.claims.exp)),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token rejected: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
