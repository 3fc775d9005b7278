//! # veil-core
//!
//! Identity and credential primitives for the Veil relay:
//! - Email-derived stable identity (SHA-256 email hash, pair session id)
//! - Signed session tokens (`sess:<exp>:<email>:<sig>`)
//! - Ephemeral TURN REST credentials
//!
//! This crate has no network code and no storage code.
//! It is the foundation the relay server builds on.

pub mod error;
pub mod identity;
pub mod token;
pub mod turn;
