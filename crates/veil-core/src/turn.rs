//! Ephemeral TURN REST credentials.
//!
//! Implements the coturn `use-auth-secret` scheme: the username is an
//! expiring `<exp>:<identity>` pair and the credential is the base64
//! HMAC-SHA1 of that username under the shared TURN secret. The TURN
//! server recomputes the MAC and honors the username until `exp`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Credential lifetime in seconds.
pub const TURN_TTL_SECS: i64 = 600;

/// A username/credential pair for a TURN allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    pub username: String,
    pub credential: String,
}

/// Derive credentials for `identity` valid for [`TURN_TTL_SECS`]
/// from `now` (unix seconds).
pub fn issue(identity: &str, secret: &str, now: i64) -> TurnCredentials {
    let expiry = now + TURN_TTL_SECS;
    let username = format!("{expiry}:{identity}");
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(username.as_bytes());
    let credential = BASE64.encode(mac.finalize().into_bytes());
    TurnCredentials { username, credential }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn username_embeds_expiry_and_identity() {
        let creds = issue("alice@example.com", "secret", NOW);
        assert_eq!(creds.username, format!("{}:alice@example.com", NOW + TURN_TTL_SECS));
    }

    #[test]
    fn credential_is_deterministic_per_secret() {
        let a = issue("alice@example.com", "secret", NOW);
        let b = issue("alice@example.com", "secret", NOW);
        let c = issue("alice@example.com", "other", NOW);
        assert_eq!(a, b);
        assert_ne!(a.credential, c.credential);
    }

    #[test]
    fn credential_is_valid_base64_of_sha1_mac() {
        let creds = issue("alice@example.com", "secret", NOW);
        let raw = BASE64.decode(&creds.credential).expect("base64");
        assert_eq!(raw.len(), 20); // SHA-1 output
    }
}
