//! Ban engine - turns a request into an allow/block verdict
//!
//! Flow per request:
//! 1. Trusted automation is allowed without touching the ledger
//! 2. Everything else is counted with one atomic `apply_visit`
//! 3. The verdict blocks as soon as the record is banned, including the
//!    request that crosses the threshold
//!
//! Ledger failures never block traffic: they produce a fail-open verdict.

use crate::address::normalize_address;
use crate::classifier::{Classifier, Identity, TrustSource};
use crate::constants;
use crate::ledger::{hours_between, Attribution, LedgerError, VisitRecord, VisitStore, VisitUpdate};
use crate::truncate_user_agent;
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::sync::Arc;

/// Ban threshold and storage limits
#[derive(Debug, Clone)]
pub struct BanPolicy {
    /// Hours after first visit (or last unban) before an address is banned
    pub ban_duration_hours: u32,
    /// Upper bound for a single ledger round-trip
    pub storage_timeout: std::time::Duration,
}

impl BanPolicy {
    pub fn ban_after(&self) -> Duration {
        Duration::hours(i64::from(self.ban_duration_hours))
    }
}

impl Default for BanPolicy {
    fn default() -> Self {
        Self {
            ban_duration_hours: constants::DEFAULT_BAN_DURATION_HOURS,
            storage_timeout: std::time::Duration::from_millis(constants::DEFAULT_STORAGE_TIMEOUT_MS),
        }
    }
}

/// Inputs the HTTP layer extracts from a request
#[derive(Debug, Clone, Default)]
pub struct VisitRequest {
    /// Resolved source address (any spelling; normalised by the engine)
    pub address: String,
    /// Declared user agent
    pub user_agent: String,
    /// Campaign fields from the query string
    pub attribution: Attribution,
    /// Address was taken from forwarding headers; never trusted as loopback
    pub forwarded: bool,
}

/// What happened to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Trusted automation, not tracked
    Trusted(TrustSource),
    /// Counted, still within the allowance
    Tracked,
    /// This request crossed the threshold and banned the address
    NewlyBanned,
    /// Address was already banned
    Banned,
    /// Ledger failed; allowed without tracking
    Degraded,
}

/// Allow/block decision plus the visit metadata used for logging
#[derive(Debug, Clone)]
pub struct Verdict {
    pub allowed: bool,
    pub outcome: Outcome,
    pub visit_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub hours_since_first_seen: f64,
}

impl Verdict {
    fn untracked(outcome: Outcome, now: DateTime<Utc>, visit_count: i64) -> Self {
        Self {
            allowed: true,
            outcome,
            visit_count,
            first_seen_at: now,
            hours_since_first_seen: 0.0,
        }
    }

    fn from_record(record: &VisitRecord, now: DateTime<Utc>) -> Self {
        let outcome = if !record.is_banned {
            Outcome::Tracked
        } else if record.banned_at == Some(now) {
            Outcome::NewlyBanned
        } else {
            Outcome::Banned
        };

        Self {
            allowed: !record.is_banned,
            outcome,
            visit_count: record.visit_count,
            first_seen_at: record.first_seen_at,
            hours_since_first_seen: hours_between(record.first_seen_at, now),
        }
    }
}

/// Per-request decision engine. Cheap to share: holds only `Arc`s and the policy.
#[derive(Clone)]
pub struct BanEngine {
    classifier: Arc<Classifier>,
    store: Arc<dyn VisitStore>,
    policy: BanPolicy,
}

impl BanEngine {
    pub fn new(classifier: Arc<Classifier>, store: Arc<dyn VisitStore>, policy: BanPolicy) -> Self {
        Self {
            classifier,
            store,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn VisitStore> {
        &self.store
    }

    /// Classify a request at the current time
    pub async fn classify_request(&self, request: &VisitRequest) -> Verdict {
        self.classify_request_at(request, Utc::now()).await
    }

    /// Classify a request at a given time
    pub async fn classify_request_at(&self, request: &VisitRequest, now: DateTime<Utc>) -> Verdict {
        // Stores keep microsecond timestamps; keep `now` comparable with what comes back
        let now = now.duration_trunc(Duration::microseconds(1)).unwrap_or(now);
        let address = normalize_address(&request.address);
        let user_agent = truncate_user_agent(&request.user_agent);

        let identity = self
            .classifier
            .classify_source(&address, &request.user_agent, !request.forwarded);
        if let Identity::Trusted(source) = identity {
            tracing::debug!("Trusted request from {} ({:?}), UA: {}", address, source, user_agent);
            return Verdict::untracked(Outcome::Trusted(source), now, 0);
        }

        let update = VisitUpdate {
            address: address.clone(),
            user_agent: request.user_agent.clone(),
            attribution: request.attribution.clone(),
            now,
            ban_after: self.policy.ban_after(),
        };

        let record = match self.apply_with_timeout(&update).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("Ledger failure for {}, allowing request untracked: {}", address, e);
                return Verdict::untracked(Outcome::Degraded, now, 1);
            }
        };

        let verdict = Verdict::from_record(&record, now);
        match verdict.outcome {
            Outcome::NewlyBanned => tracing::warn!(
                "IP {} has been banned after {:.2} hours ({} visits)",
                address,
                verdict.hours_since_first_seen,
                verdict.visit_count
            ),
            Outcome::Banned => tracing::info!(
                "Banned IP {} seen again: visits={}, UA: {}",
                address,
                verdict.visit_count,
                user_agent
            ),
            _ if verdict.visit_count == 1 => tracing::info!("New IP tracked: {}", address),
            _ => tracing::debug!(
                "IP {}: visits={}, hours={:.2}",
                address,
                verdict.visit_count,
                verdict.hours_since_first_seen
            ),
        }

        verdict
    }

    async fn apply_with_timeout(&self, update: &VisitUpdate) -> Result<VisitRecord, LedgerError> {
        let timeout = self.policy.storage_timeout;
        match tokio::time::timeout(timeout, self.store.apply_visit(update)).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout(timeout)),
        }
    }
}
