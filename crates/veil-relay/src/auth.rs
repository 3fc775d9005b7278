//! Credential resolution for the AUTH frame.
//!
//! Two credential forms are accepted. A session token (`sess:` prefix)
//! is verified locally against the signing key. Anything else is
//! treated as an identity-provider bearer token and checked with a side
//! request to the provider's tokeninfo endpoint; the response must name
//! one of the compiled-in client audiences. Either way a successful
//! resolution reissues a fresh session token for the client to store.

use serde::Deserialize;
use thiserror::Error;
use veil_core::token::{self, SessionKey};

const TOKENINFO_ENDPOINT: &str = "https://oauth2.googleapis.com/tokeninfo";

/// OAuth client ids allowed to authenticate against this relay.
const ALLOWED_AUDIENCES: &[&str] = &[
    // Desktop
    "312740655781-h0qe2cmnvc7jb4gvrbn95ucf30v2dcqo.apps.googleusercontent.com",
    // Android
    "312740655781-5o0faieqvjvdpq2p1l3t1ov74b6hmr1f.apps.googleusercontent.com",
];

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Token(#[from] veil_core::error::Error),

    #[error("identity endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("identity endpoint rejected the token")]
    Rejected,

    #[error("invalid token audience: {0}")]
    Audience(String),
}

#[derive(Deserialize)]
struct TokenInfo {
    email: String,
    aud: String,
}

/// Verify a bearer token with the identity provider and return the
/// verified email.
pub async fn verify_bearer(http: &reqwest::Client, token: &str) -> Result<String, AuthError> {
    let resp = http
        .get(TOKENINFO_ENDPOINT)
        .query(&[("id_token", token)])
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(AuthError::Rejected);
    }
    let info: TokenInfo = resp.json().await?;
    if !ALLOWED_AUDIENCES.contains(&info.aud.as_str()) {
        return Err(AuthError::Audience(info.aud));
    }
    Ok(info.email)
}

/// Resolve either credential form to `(email, fresh session token)`.
pub async fn resolve_token(
    http: &reqwest::Client,
    key: &SessionKey,
    token: &str,
    now: i64,
) -> Result<(String, String), AuthError> {
    let email = if token::is_session_token(token) {
        key.verify(token, now)?
    } else {
        verify_bearer(http, token).await?
    };
    let reissued = key.mint(&email, now);
    Ok((email, reissued))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[tokio::test]
    async fn session_token_resolves_locally_and_reissues() {
        let key = SessionKey::from_seed("seed");
        let http = reqwest::Client::new();
        let token = key.mint("alice@example.com", NOW - 1000);

        let (email, reissued) = resolve_token(&http, &key, &token, NOW).await.unwrap();
        assert_eq!(email, "alice@example.com");
        assert_ne!(reissued, token);
        assert_eq!(key.verify(&reissued, NOW).unwrap(), "alice@example.com");
    }

    #[tokio::test]
    async fn expired_session_token_is_rejected() {
        let key = SessionKey::from_seed("seed");
        let http = reqwest::Client::new();
        let token = key.mint("alice@example.com", NOW - 40 * 24 * 60 * 60);

        let err = resolve_token(&http, &key, &token, NOW).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::Token(veil_core::error::Error::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn foreign_session_token_is_rejected() {
        let key = SessionKey::from_seed("seed");
        let other = SessionKey::from_seed("other");
        let http = reqwest::Client::new();
        let token = other.mint("alice@example.com", NOW);

        let err = resolve_token(&http, &key, &token, NOW).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::Token(veil_core::error::Error::InvalidSignature)
        ));
    }
}
