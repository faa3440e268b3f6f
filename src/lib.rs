//! Turnstile - HTTP admission control
//!
//! This crate gates inbound HTTP requests against a per-identity request budget.
//! Identities are API tokens or, absent one, client addresses. Each identity is
//! counted in fixed windows; exceeding the threshold blocks it for a cooldown
//! period. Counters live in a pluggable store whose atomic increment keeps the
//! decision correct under concurrent requests.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
