//! Environment-driven server configuration.
//!
//! Read once at startup. A missing TURN secret is fatal: without it the
//! server would vend credentials no TURN server accepts.

use thiserror::Error;
use veil_core::token::SessionKey;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TURN_SECRET is not set")]
    MissingTurnSecret,
}

#[derive(Clone)]
pub struct Config {
    /// Shared secret for TURN REST credentials.
    pub turn_secret: String,
    /// Hostname clients should dial for TURN allocations.
    pub turn_host: String,
    /// Session-token signing key, derived from `AUTH_SESSION_SECRET`.
    pub session_key: SessionKey,
}

impl Config {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let turn_secret = std::env::var("TURN_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingTurnSecret)?;
        let turn_host = std::env::var("TURN_HOST").unwrap_or_default();
        let seed = std::env::var("AUTH_SESSION_SECRET").unwrap_or_default();
        Ok(Self {
            turn_secret,
            turn_host,
            session_key: SessionKey::from_seed(&seed),
        })
    }

    /// Construct directly, bypassing the environment. Used by tests.
    pub fn new(turn_secret: &str, turn_host: &str, session_seed: &str) -> Self {
        Self {
            turn_secret: turn_secret.to_string(),
            turn_host: turn_host.to_string(),
            session_key: SessionKey::from_seed(session_seed),
        }
    }
}
