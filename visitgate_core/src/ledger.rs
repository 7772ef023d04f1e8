//! Visit ledger - per-address visit records and the storage contract
//!
//! One record exists per normalised source address. Stores must make
//! [`VisitStore::apply_visit`] atomic per address: the create-or-update, the
//! ban transition and the counter increment happen as one operation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Ledger errors
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Ledger operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// Wrap any backend error (database driver, I/O)
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        LedgerError::Backend(Box::new(err))
    }
}

/// Campaign-tracking values carried on a request's query string
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub gclid: Option<String>,
    pub gclsrc: Option<String>,
    pub gbraid: Option<String>,
    pub wbraid: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
}

impl Attribution {
    /// Query parameter names, which double as column names
    pub const FIELDS: [&'static str; 9] = [
        "gclid",
        "gclsrc",
        "gbraid",
        "wbraid",
        "utm_source",
        "utm_medium",
        "utm_campaign",
        "utm_term",
        "utm_content",
    ];

    /// Pick the attribution fields out of query pairs. Unknown names and
    /// empty values are ignored; the first non-empty value of a name wins.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut attribution = Self::default();
        for (name, value) in pairs {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            if let Some(slot) = attribution.field_mut(name) {
                if slot.is_none() {
                    *slot = Some(value.to_string());
                }
            }
        }
        attribution
    }

    pub fn is_empty(&self) -> bool {
        self.iter().all(|(_, v)| v.is_none())
    }

    /// Fill fields that are still unset from `incoming`. Populated fields are
    /// never overwritten and empty incoming values are skipped.
    pub fn merge_missing(&mut self, incoming: &Attribution) {
        for name in Self::FIELDS {
            let value = match incoming.get(name) {
                Some(v) if !v.is_empty() => v.to_string(),
                _ => continue,
            };
            if let Some(slot) = self.field_mut(name) {
                if slot.as_deref().map_or(true, str::is_empty) {
                    *slot = Some(value);
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let value = match name {
            "gclid" => &self.gclid,
            "gclsrc" => &self.gclsrc,
            "gbraid" => &self.gbraid,
            "wbraid" => &self.wbraid,
            "utm_source" => &self.utm_source,
            "utm_medium" => &self.utm_medium,
            "utm_campaign" => &self.utm_campaign,
            "utm_term" => &self.utm_term,
            "utm_content" => &self.utm_content,
            _ => return None,
        };
        value.as_deref()
    }

    /// (name, value) for all nine fields, in column order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Option<&str>)> + '_ {
        Self::FIELDS.into_iter().map(move |name| (name, self.get(name)))
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            "gclid" => Some(&mut self.gclid),
            "gclsrc" => Some(&mut self.gclsrc),
            "gbraid" => Some(&mut self.gbraid),
            "wbraid" => Some(&mut self.wbraid),
            "utm_source" => Some(&mut self.utm_source),
            "utm_medium" => Some(&mut self.utm_medium),
            "utm_campaign" => Some(&mut self.utm_campaign),
            "utm_term" => Some(&mut self.utm_term),
            "utm_content" => Some(&mut self.utm_content),
            _ => None,
        }
    }
}

/// Ledger entry for one source address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitRecord {
    pub address: String,
    /// User agent of the request that created the record
    pub user_agent: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub visit_count: i64,
    pub is_banned: bool,
    pub banned_at: Option<DateTime<Utc>>,
    /// Last admin unban; restarts the ban clock
    pub unbanned_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub attribution: Attribution,
}

impl VisitRecord {
    /// Record for an address seen for the first time
    pub fn new(address: &str, user_agent: &str, now: DateTime<Utc>) -> Self {
        Self {
            address: address.to_string(),
            user_agent: Some(user_agent.to_string()).filter(|ua| !ua.is_empty()),
            first_seen_at: now,
            last_seen_at: now,
            visit_count: 1,
            is_banned: false,
            banned_at: None,
            unbanned_at: None,
            attribution: Attribution::default(),
        }
    }

    /// Fractional hours between first visit and `now`
    pub fn hours_since_first_seen(&self, now: DateTime<Utc>) -> f64 {
        hours_between(self.first_seen_at, now)
    }

    /// Start of the allowance window: the last unban, or the first visit
    pub fn ban_clock_start(&self) -> DateTime<Utc> {
        match self.unbanned_at {
            Some(unbanned) if unbanned > self.first_seen_at => unbanned,
            _ => self.first_seen_at,
        }
    }

    /// Whether the allowance window has run out at `now`
    pub fn ban_due(&self, now: DateTime<Utc>, ban_after: Duration) -> bool {
        now - self.ban_clock_start() >= ban_after
    }

    /// Apply one counted visit to an existing record
    ///
    /// This is the reference semantics that every store must reproduce
    /// atomically: ban transition (at most once), counter increment,
    /// timestamp update and attribution merge.
    pub fn record_visit(&mut self, update: &VisitUpdate) {
        if !self.is_banned && self.ban_due(update.now, update.ban_after) {
            self.is_banned = true;
            self.banned_at = Some(update.now);
        }

        self.visit_count += 1;
        if update.now > self.last_seen_at {
            self.last_seen_at = update.now;
        }
        self.attribution.merge_missing(&update.attribution);
    }

    /// Admin ban/unban. Banning keeps an existing `banned_at`; unbanning
    /// clears it and restarts the ban clock.
    pub fn set_banned(&mut self, banned: bool, now: DateTime<Utc>) {
        if banned {
            if !self.is_banned {
                self.is_banned = true;
                self.banned_at = Some(now);
            }
        } else {
            self.is_banned = false;
            self.banned_at = None;
            self.unbanned_at = Some(now);
        }
    }
}

/// Fractional hours from `from` to `to`, never negative
pub fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let millis = (to - from).num_milliseconds().max(0);
    millis as f64 / 3_600_000.0
}

/// Everything a store needs to apply one counted visit
#[derive(Debug, Clone)]
pub struct VisitUpdate {
    pub address: String,
    pub user_agent: String,
    pub attribution: Attribution,
    pub now: DateTime<Utc>,
    pub ban_after: Duration,
}

/// Storage contract for the visit ledger
#[async_trait]
pub trait VisitStore: Send + Sync {
    /// Short backend name for logs and health output
    fn backend_name(&self) -> &'static str;

    /// Look up a record by normalised address
    async fn find_by_address(&self, address: &str) -> Result<Option<VisitRecord>, LedgerError>;

    /// Create the record for an address, or return the existing one
    async fn create_address(
        &self,
        address: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> Result<VisitRecord, LedgerError>;

    /// Create-or-update in one atomic step (see [`VisitRecord::record_visit`]).
    /// A record created by this call starts with `visit_count = 1` and is not banned.
    async fn apply_visit(&self, update: &VisitUpdate) -> Result<VisitRecord, LedgerError>;

    /// Admin ban/unban; `None` if the address is unknown
    async fn set_banned(
        &self,
        address: &str,
        banned: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<VisitRecord>, LedgerError>;

    /// All banned records, most recently banned first
    async fn list_banned(&self) -> Result<Vec<VisitRecord>, LedgerError>;

    /// Cheap connectivity check
    async fn ping(&self) -> Result<(), LedgerError>;
}
