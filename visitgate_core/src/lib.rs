//! visitgate core - visitor classification and ban engine
//!
//! This crate decides, per request, whether a client is a trusted crawler,
//! an ordinary visitor, or an address whose visitation allowance is used up.
//! It owns:
//! - Identity classification (crawler user-agent tokens, address whitelist)
//! - The visit ledger contract and an in-memory ledger
//! - The ban engine that turns ledger state into a verdict

pub mod address;
pub mod classifier;
pub mod engine;
pub mod ledger;
pub mod memory;
pub mod whitelist;

pub use address::normalize_address;
pub use classifier::{Classifier, Identity, TrustSource};
pub use engine::{BanEngine, BanPolicy, Outcome, Verdict, VisitRequest};
pub use ledger::{Attribution, LedgerError, VisitRecord, VisitStore, VisitUpdate};
pub use memory::MemoryVisitStore;
pub use whitelist::{AddressRule, WhitelistError, WhitelistRules};

/// Constants shared between the core and the HTTP front door
pub mod constants {
    /// Default number of hours after first visit before an address is banned
    pub const DEFAULT_BAN_DURATION_HOURS: u32 = 4;

    /// Default per-operation ledger timeout in milliseconds
    pub const DEFAULT_STORAGE_TIMEOUT_MS: u64 = 5_000;

    /// User agents are cut to this many characters in log lines
    pub const LOG_USER_AGENT_CHARS: usize = 100;
}

/// Truncate a user agent for log output
pub fn truncate_user_agent(user_agent: &str) -> &str {
    match user_agent.char_indices().nth(constants::LOG_USER_AGENT_CHARS) {
        Some((idx, _)) => &user_agent[..idx],
        None => user_agent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_user_agent() {
        assert_eq!(truncate_user_agent("curl/8.0"), "curl/8.0");

        let long = "x".repeat(250);
        assert_eq!(truncate_user_agent(&long).len(), 100);

        // Multi-byte characters are never split
        let cyrillic = "я".repeat(150);
        assert_eq!(truncate_user_agent(&cyrillic).chars().count(), 100);
    }
}
