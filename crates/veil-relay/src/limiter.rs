//! Rate limiting.
//!
//! Two independent limiters with different jobs:
//!
//! - [`AuthRateLimiter`] bounds identity-provider login attempts per
//!   source IP over a sliding 60-second window. Session-token logins
//!   are exempt (the caller never consults the limiter for them).
//!   A rejection closes the transport.
//! - [`MessageWindow`] bounds relayed messages per connection over a
//!   fixed one-second window. A rejection produces an error frame but
//!   keeps the connection open.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Identity-provider AUTH attempts allowed per IP per window.
pub const MAX_AUTH_ATTEMPTS: usize = 3;

/// Sliding window for auth attempts.
pub const AUTH_WINDOW: Duration = Duration::from_secs(60);

/// Relayed messages allowed per connection per second.
pub const MAX_MSGS_PER_SECOND: u32 = 100;

/// Per-IP limiter for bearer-token authentication attempts.
#[derive(Default)]
pub struct AuthRateLimiter {
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
}

impl AuthRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt from `ip` and return whether it is allowed.
    pub fn check(&self, ip: &str) -> bool {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: &str, now: Instant) -> bool {
        let mut attempts = self.attempts.lock().unwrap();
        let entry = attempts.entry(ip.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < AUTH_WINDOW);
        if entry.len() >= MAX_AUTH_ATTEMPTS {
            return false;
        }
        entry.push(now);
        true
    }
}

/// Fixed-window message counter kept on each connection.
#[derive(Debug, Default)]
pub struct MessageWindow {
    window_start: Option<Instant>,
    count: u32,
}

impl MessageWindow {
    /// Count one message and return whether it is within the cap.
    /// The window resets once a full second has elapsed.
    pub fn allow(&mut self, now: Instant) -> bool {
        let elapsed = self
            .window_start
            .map(|start| now.duration_since(start) >= Duration::from_secs(1))
            .unwrap_or(true);
        if elapsed {
            self.window_start = Some(now);
            self.count = 0;
        }
        self.count += 1;
        self.count <= MAX_MSGS_PER_SECOND
    }
}
