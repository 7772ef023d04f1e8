//! Abuse prevention module
//!
//! Provides protection against:
//! - Request floods (per-address front-door rate limit)
//!
//! Long-term visit tracking and bans live in `visitgate_core`.

pub mod rate_limit;

pub use rate_limit::{RateLimitConfig, RateLimiter};
