//! Stable user identity derived from email addresses.
//!
//! A user is identified everywhere (in the database, on the wire, in
//! the connection log) by the hex SHA-256 of their normalized email.
//! A friendship between two users gets a deterministic session id both
//! peers can compute independently: the hex SHA-256 of the two
//! normalized emails joined by `:` in lexicographic order.

use sha2::{Digest, Sha256};

/// Lowercase and trim an email before hashing or comparing it.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Hex SHA-256 of the normalized email. Stable user identity.
pub fn email_hash(email: &str) -> String {
    let normalized = normalize_email(email);
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Deterministic session id for a pair of users.
///
/// Both peers compute the same value regardless of argument order.
pub fn pair_session_id(email_a: &str, email_b: &str) -> String {
    let a = normalize_email(email_a);
    let b = normalize_email(email_b);
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    hex::encode(Sha256::digest(format!("{lo}:{hi}").as_bytes()))
}
