//! Signed session tokens.
//!
//! Format: `sess:<expiry-unix-seconds>:<email>:<sig>` where `<sig>` is
//! the lowercase-hex HMAC-SHA256 of `sess:<exp>:<email>` under a key
//! derived from a configured seed. The email travels in the clear;
//! the token guarantees unforgeability, not confidentiality.
//!
//! Verification splits on `:` and requires exactly four parts, so an
//! email containing a colon fails closed instead of mis-parsing.
//!
//! The current time is an explicit parameter on mint and verify;
//! callers pass unix seconds.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Prefix distinguishing a session token from a bearer token.
pub const SESSION_PREFIX: &str = "sess:";

/// Session tokens live for 30 days and are reissued on every
/// successful authentication.
pub const SESSION_LIFETIME_SECS: i64 = 30 * 24 * 60 * 60;

/// Returns true if the credential is a session token rather than an
/// identity-provider bearer token.
pub fn is_session_token(token: &str) -> bool {
    token.starts_with(SESSION_PREFIX)
}

/// HMAC key for session tokens, derived from a configured seed.
#[derive(Clone)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Derive the signing key as SHA-256 of the trimmed seed.
    pub fn from_seed(seed: &str) -> Self {
        let digest = Sha256::digest(seed.trim().as_bytes());
        Self(digest.into())
    }

    /// Mint a token for `email` expiring [`SESSION_LIFETIME_SECS`]
    /// after `now`.
    pub fn mint(&self, email: &str, now: i64) -> String {
        let exp = now + SESSION_LIFETIME_SECS;
        let data = format!("{SESSION_PREFIX}{exp}:{email}");
        let sig = hex::encode(self.sign(&data));
        format!("{data}:{sig}")
    }

    /// Verify a token and return the embedded email.
    ///
    /// Signature comparison is constant-time. A token is valid while
    /// `now <= exp`.
    pub fn verify(&self, token: &str, now: i64) -> Result<String> {
        let parts: Vec<&str> = token.split(':').collect();
        if parts.len() != 4 || parts[0] != "sess" {
            return Err(Error::MalformedToken);
        }
        let (exp_str, email, sig_hex) = (parts[1], parts[2], parts[3]);

        let data = format!("{SESSION_PREFIX}{exp_str}:{email}");
        let sig = hex::decode(sig_hex).map_err(|_| Error::InvalidSignature)?;
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("hmac accepts any key length");
        mac.update(data.as_bytes());
        mac.verify_slice(&sig).map_err(|_| Error::InvalidSignature)?;

        let exp: i64 = exp_str.parse().map_err(|_| Error::MalformedToken)?;
        if now > exp {
            return Err(Error::TokenExpired);
        }
        Ok(email.to_string())
    }

    fn sign(&self, data: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("hmac accepts any key length");
        mac.update(data.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}
