//! Identity classification - decides whether a request comes from trusted automation
//!
//! Classification is pure: it only reads the rule tables built at startup.

use crate::whitelist::WhitelistRules;
use once_cell::sync::Lazy;

/// User-agent tokens of crawlers and link-preview fetchers that must never be
/// tracked or banned
static CRAWLER_TOKENS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        // Search engines
        "googlebot", "bingbot", "yandexbot", "baiduspider", "duckduckbot", "slurp", "applebot",
        // Social / link previews
        "facebookexternalhit", "twitterbot", "linkedinbot", "whatsapp", "telegrambot",
        // Archives
        "ia_archiver",
    ]
});

/// Loopback spellings that are always eligible for the whitelist path
const LOOPBACK_ADDRESSES: [&str; 3] = ["127.0.0.1", "::1", "localhost"];

/// Why a request was trusted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustSource {
    /// User agent contains a known crawler token
    CrawlerToken(String),
    /// Address matched an operator's whitelist rules
    Whitelisted { operator: String },
    /// Local request
    Loopback,
}

/// Result of classifying a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Trusted(TrustSource),
    Unclassified,
}

impl Identity {
    pub fn is_trusted(&self) -> bool {
        matches!(self, Identity::Trusted(_))
    }
}

/// Read-only classifier shared by every request
#[derive(Debug, Clone)]
pub struct Classifier {
    trust_automation: bool,
    agent_tokens: Vec<String>,
    whitelist: WhitelistRules,
}

impl Classifier {
    /// Build a classifier from the built-in crawler tokens, any extra tokens
    /// (from configuration or the whitelist file) and the whitelist
    pub fn new(trust_automation: bool, extra_tokens: &[String], whitelist: WhitelistRules) -> Self {
        let mut agent_tokens: Vec<String> = CRAWLER_TOKENS.iter().map(|t| t.to_string()).collect();

        for token in extra_tokens.iter().chain(whitelist.agent_tokens()) {
            let token = token.trim().to_lowercase();
            if !token.is_empty() && !agent_tokens.contains(&token) {
                agent_tokens.push(token);
            }
        }

        Self {
            trust_automation,
            agent_tokens,
            whitelist,
        }
    }

    /// Classify a request by its normalised source address and user agent
    pub fn classify(&self, address: &str, user_agent: &str) -> Identity {
        self.classify_source(address, user_agent, true)
    }

    /// Like [`Classifier::classify`]; `loopback_eligible` is false when the
    /// address came from forwarding headers rather than the socket
    pub fn classify_source(&self, address: &str, user_agent: &str, loopback_eligible: bool) -> Identity {
        if !self.trust_automation {
            return Identity::Unclassified;
        }

        if let Some(token) = self.crawler_token(user_agent) {
            return Identity::Trusted(TrustSource::CrawlerToken(token.to_string()));
        }

        if loopback_eligible && LOOPBACK_ADDRESSES.contains(&address) {
            return Identity::Trusted(TrustSource::Loopback);
        }

        match self.whitelist.find_operator(address) {
            Some(operator) => Identity::Trusted(TrustSource::Whitelisted {
                operator: operator.to_string(),
            }),
            None => Identity::Unclassified,
        }
    }

    /// Find the first crawler token contained in a user agent (case-insensitive)
    fn crawler_token(&self, user_agent: &str) -> Option<&str> {
        if user_agent.is_empty() {
            return None;
        }

        let ua = user_agent.to_lowercase();
        self.agent_tokens
            .iter()
            .find(|token| ua.contains(token.as_str()))
            .map(|t| t.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/124.0 Safari/537.36";

    fn classifier() -> Classifier {
        Classifier::new(true, &[], WhitelistRules::builtin())
    }

    #[test]
    fn test_crawler_user_agents() {
        let c = classifier();
        let ua = "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";
        assert_eq!(
            c.classify("198.51.100.4", ua),
            Identity::Trusted(TrustSource::CrawlerToken("googlebot".to_string()))
        );
        assert!(c.classify("198.51.100.4", "TelegramBot (like TwitterBot)").is_trusted());
        assert!(c.classify("198.51.100.4", "WhatsApp/2.23.20.0").is_trusted());
        assert!(c.classify("198.51.100.4", "facebookexternalhit/1.1").is_trusted());
    }

    #[test]
    fn test_ordinary_browser_is_unclassified() {
        let c = classifier();
        assert_eq!(c.classify("198.51.100.4", CHROME), Identity::Unclassified);
        assert_eq!(c.classify("198.51.100.4", ""), Identity::Unclassified);
    }

    #[test]
    fn test_whitelisted_ranges() {
        let c = classifier();
        assert_eq!(
            c.classify("66.249.66.1", CHROME),
            Identity::Trusted(TrustSource::Whitelisted {
                operator: "google".to_string()
            })
        );
        assert!(c.classify("64.233.160.5", CHROME).is_trusted());
        assert!(!c.classify("66.250.66.1", CHROME).is_trusted());
    }

    #[test]
    fn test_loopback_always_eligible() {
        let c = Classifier::new(true, &[], WhitelistRules::empty());
        assert_eq!(c.classify("127.0.0.1", CHROME), Identity::Trusted(TrustSource::Loopback));
        assert_eq!(c.classify("::1", CHROME), Identity::Trusted(TrustSource::Loopback));
        assert_eq!(c.classify("localhost", CHROME), Identity::Trusted(TrustSource::Loopback));
    }

    #[test]
    fn test_forwarded_loopback_is_not_trusted() {
        let c = classifier();
        assert_eq!(c.classify_source("127.0.0.1", CHROME, false), Identity::Unclassified);
        assert_eq!(c.classify_source("localhost", CHROME, false), Identity::Unclassified);
        // Other trust paths do not depend on where the address came from
        assert!(c.classify_source("66.249.66.1", CHROME, false).is_trusted());
        assert!(c.classify_source("127.0.0.1", "Googlebot/2.1", false).is_trusted());
    }

    #[test]
    fn test_flag_disables_all_trust() {
        let c = Classifier::new(false, &[], WhitelistRules::builtin());
        assert_eq!(c.classify("66.249.66.1", "Googlebot/2.1"), Identity::Unclassified);
        assert_eq!(c.classify("127.0.0.1", CHROME), Identity::Unclassified);
    }

    #[test]
    fn test_extra_tokens() {
        let c = Classifier::new(true, &["  UptimeRobot ".to_string()], WhitelistRules::empty());
        assert!(c.classify("198.51.100.4", "Mozilla/5.0 (compatible; UptimeRobot/2.0)").is_trusted());
    }

    #[test]
    fn test_malformed_addresses_are_unclassified() {
        let c = classifier();
        assert_eq!(c.classify("66.249", CHROME), Identity::Unclassified);
        assert_eq!(c.classify("66.249.1.2.3", CHROME), Identity::Unclassified);
        assert_eq!(c.classify("garbage", CHROME), Identity::Unclassified);
    }
}
