//! In-memory visit ledger
//!
//! Used when no database is configured and in tests. State is lost on
//! restart. Per-address atomicity comes from holding the DashMap entry
//! lock for the whole update.

use crate::ledger::{LedgerError, VisitRecord, VisitStore, VisitUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct MemoryVisitStore {
    records: DashMap<String, VisitRecord>,
}

impl MemoryVisitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked addresses
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl VisitStore for MemoryVisitStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn find_by_address(&self, address: &str) -> Result<Option<VisitRecord>, LedgerError> {
        Ok(self.records.get(address).map(|r| r.value().clone()))
    }

    async fn create_address(
        &self,
        address: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> Result<VisitRecord, LedgerError> {
        let record = self
            .records
            .entry(address.to_string())
            .or_insert_with(|| VisitRecord::new(address, user_agent, now));
        Ok(record.value().clone())
    }

    async fn apply_visit(&self, update: &VisitUpdate) -> Result<VisitRecord, LedgerError> {
        match self.records.entry(update.address.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.record_visit(update);
                Ok(record.clone())
            }
            Entry::Vacant(entry) => {
                let mut record = VisitRecord::new(&update.address, &update.user_agent, update.now);
                record.attribution.merge_missing(&update.attribution);
                Ok(entry.insert(record).value().clone())
            }
        }
    }

    async fn set_banned(
        &self,
        address: &str,
        banned: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<VisitRecord>, LedgerError> {
        Ok(self.records.get_mut(address).map(|mut record| {
            record.set_banned(banned, now);
            record.value().clone()
        }))
    }

    async fn list_banned(&self) -> Result<Vec<VisitRecord>, LedgerError> {
        let mut banned: Vec<VisitRecord> = self
            .records
            .iter()
            .filter(|r| r.is_banned)
            .map(|r| r.value().clone())
            .collect();
        banned.sort_by(|a, b| b.banned_at.cmp(&a.banned_at));
        Ok(banned)
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}
