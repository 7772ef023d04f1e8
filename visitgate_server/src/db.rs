//! Database connection, schema setup and the PostgreSQL visit ledger

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use visitgate_core::{Attribution, LedgerError, VisitRecord, VisitStore, VisitUpdate};

/// Initialize the database connection pool
///
/// Connections are opened lazily so an unreachable database degrades the
/// proxy (fail-open verdicts) instead of preventing startup.
pub fn init_pool(database_url: &str, max_connections: u32, acquire_timeout: Duration) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect_lazy(database_url)
}

/// Base table; column names match existing `ip_tracking` deployments
const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS ip_tracking (
        ip_address  TEXT PRIMARY KEY,
        user_agent  TEXT,
        first_visit TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_visit  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        visit_count BIGINT NOT NULL DEFAULT 1,
        is_banned   BOOLEAN NOT NULL DEFAULT FALSE,
        banned_at   TIMESTAMPTZ,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

/// Columns added after the first release
const ADDITIVE_COLUMNS: [&str; 10] = [
    "ALTER TABLE ip_tracking ADD COLUMN IF NOT EXISTS unbanned_at TIMESTAMPTZ",
    "ALTER TABLE ip_tracking ADD COLUMN IF NOT EXISTS gclid TEXT",
    "ALTER TABLE ip_tracking ADD COLUMN IF NOT EXISTS gclsrc TEXT",
    "ALTER TABLE ip_tracking ADD COLUMN IF NOT EXISTS gbraid TEXT",
    "ALTER TABLE ip_tracking ADD COLUMN IF NOT EXISTS wbraid TEXT",
    "ALTER TABLE ip_tracking ADD COLUMN IF NOT EXISTS utm_source TEXT",
    "ALTER TABLE ip_tracking ADD COLUMN IF NOT EXISTS utm_medium TEXT",
    "ALTER TABLE ip_tracking ADD COLUMN IF NOT EXISTS utm_campaign TEXT",
    "ALTER TABLE ip_tracking ADD COLUMN IF NOT EXISTS utm_term TEXT",
    "ALTER TABLE ip_tracking ADD COLUMN IF NOT EXISTS utm_content TEXT",
];

const INDEXES: [&str; 4] = [
    "CREATE INDEX IF NOT EXISTS idx_ip_tracking_gclid ON ip_tracking(gclid)",
    "CREATE INDEX IF NOT EXISTS idx_ip_tracking_utm_campaign ON ip_tracking(utm_campaign)",
    "CREATE INDEX IF NOT EXISTS idx_ip_tracking_utm_source ON ip_tracking(utm_source)",
    "CREATE INDEX IF NOT EXISTS idx_ip_tracking_banned ON ip_tracking(banned_at) WHERE is_banned",
];

/// Outcome of a schema setup run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Run schema setup
///
/// Every statement runs on its own. "Already exists" errors are skipped,
/// anything else is logged and counted; the caller decides whether a failed
/// statement is fatal.
pub async fn run_migrations(pool: &PgPool) -> MigrationReport {
    let mut report = MigrationReport::default();

    let statements = std::iter::once(CREATE_TABLE)
        .chain(ADDITIVE_COLUMNS)
        .chain(INDEXES);

    for statement in statements {
        let summary = statement.split_whitespace().collect::<Vec<_>>().join(" ");
        match sqlx::query(statement).execute(pool).await {
            Ok(_) => {
                tracing::debug!("Executed: {}", summary);
                report.applied += 1;
            }
            Err(e) if is_already_exists(&e) => {
                tracing::debug!("Already exists: {}", summary);
                report.skipped += 1;
            }
            Err(e) => {
                tracing::error!("Schema statement failed: {} ({})", summary, e);
                report.failed += 1;
            }
        }
    }

    report
}

/// duplicate_column, duplicate_table, duplicate_object
fn is_already_exists(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(db_err.code().as_deref(), Some("42701" | "42P07" | "42710")),
        _ => false,
    }
}

const RECORD_COLUMNS: &str = "ip_address, user_agent, first_visit, last_visit, visit_count, is_banned, \
     banned_at, unbanned_at, gclid, gclsrc, gbraid, wbraid, utm_source, utm_medium, utm_campaign, \
     utm_term, utm_content";

/// Row of the `ip_tracking` table
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VisitRow {
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub first_visit: DateTime<Utc>,
    pub last_visit: DateTime<Utc>,
    pub visit_count: i64,
    pub is_banned: bool,
    pub banned_at: Option<DateTime<Utc>>,
    pub unbanned_at: Option<DateTime<Utc>>,
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

impl From<VisitRow> for VisitRecord {
    fn from(row: VisitRow) -> Self {
        VisitRecord {
            address: row.ip_address,
            user_agent: row.user_agent,
            first_seen_at: row.first_visit,
            last_seen_at: row.last_visit,
            visit_count: row.visit_count,
            is_banned: row.is_banned,
            banned_at: row.banned_at,
            unbanned_at: row.unbanned_at,
            attribution: Attribution {
                gclid: row.gclid,
                gclsrc: row.gclsrc,
                gbraid: row.gbraid,
                wbraid: row.wbraid,
                utm_source: row.utm_source,
                utm_medium: row.utm_medium,
                utm_campaign: row.utm_campaign,
                utm_term: row.utm_term,
                utm_content: row.utm_content,
            },
        }
    }
}

/// Visit ledger backed by the `ip_tracking` table
#[derive(Clone)]
pub struct PgVisitStore {
    pool: PgPool,
}

impl PgVisitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VisitStore for PgVisitStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn find_by_address(&self, address: &str) -> Result<Option<VisitRecord>, LedgerError> {
        let row = sqlx::query_as::<_, VisitRow>(&format!(
            "SELECT {} FROM ip_tracking WHERE ip_address = $1",
            RECORD_COLUMNS
        ))
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(LedgerError::backend)?;

        Ok(row.map(VisitRecord::from))
    }

    async fn create_address(
        &self,
        address: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> Result<VisitRecord, LedgerError> {
        // The no-op update makes RETURNING yield the existing row on conflict
        let row = sqlx::query_as::<_, VisitRow>(&format!(
            r#"
            INSERT INTO ip_tracking (ip_address, user_agent, first_visit, last_visit)
            VALUES ($1, NULLIF($2, ''), $3, $3)
            ON CONFLICT (ip_address) DO UPDATE SET ip_address = EXCLUDED.ip_address
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(address)
        .bind(user_agent)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(LedgerError::backend)?;

        Ok(row.into())
    }

    async fn apply_visit(&self, update: &VisitUpdate) -> Result<VisitRecord, LedgerError> {
        // One statement: insert, or bump the counter, ban once the clock
        // (last unban, else first visit) has run out, and fill empty
        // attribution columns. Row locking on conflict serialises concurrent
        // visits from the same address.
        let row = sqlx::query_as::<_, VisitRow>(&format!(
            r#"
            INSERT INTO ip_tracking AS t (
                ip_address, user_agent, first_visit, last_visit, visit_count,
                gclid, gclsrc, gbraid, wbraid, utm_source, utm_medium, utm_campaign, utm_term, utm_content
            )
            VALUES ($1, NULLIF($2, ''), $3, $3, 1, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (ip_address) DO UPDATE SET
                visit_count = t.visit_count + 1,
                last_visit = GREATEST(t.last_visit, EXCLUDED.last_visit),
                is_banned = t.is_banned
                    OR EXTRACT(EPOCH FROM (EXCLUDED.last_visit - GREATEST(t.unbanned_at, t.first_visit))) >= $4,
                banned_at = CASE
                    WHEN t.is_banned THEN t.banned_at
                    WHEN EXTRACT(EPOCH FROM (EXCLUDED.last_visit - GREATEST(t.unbanned_at, t.first_visit))) >= $4
                        THEN EXCLUDED.last_visit
                    ELSE NULL
                END,
                gclid = COALESCE(NULLIF(t.gclid, ''), EXCLUDED.gclid),
                gclsrc = COALESCE(NULLIF(t.gclsrc, ''), EXCLUDED.gclsrc),
                gbraid = COALESCE(NULLIF(t.gbraid, ''), EXCLUDED.gbraid),
                wbraid = COALESCE(NULLIF(t.wbraid, ''), EXCLUDED.wbraid),
                utm_source = COALESCE(NULLIF(t.utm_source, ''), EXCLUDED.utm_source),
                utm_medium = COALESCE(NULLIF(t.utm_medium, ''), EXCLUDED.utm_medium),
                utm_campaign = COALESCE(NULLIF(t.utm_campaign, ''), EXCLUDED.utm_campaign),
                utm_term = COALESCE(NULLIF(t.utm_term, ''), EXCLUDED.utm_term),
                utm_content = COALESCE(NULLIF(t.utm_content, ''), EXCLUDED.utm_content),
                updated_at = NOW()
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(&update.address)
        .bind(&update.user_agent)
        .bind(update.now)
        .bind(update.ban_after.num_seconds())
        .bind(non_empty(&update.attribution, "gclid"))
        .bind(non_empty(&update.attribution, "gclsrc"))
        .bind(non_empty(&update.attribution, "gbraid"))
        .bind(non_empty(&update.attribution, "wbraid"))
        .bind(non_empty(&update.attribution, "utm_source"))
        .bind(non_empty(&update.attribution, "utm_medium"))
        .bind(non_empty(&update.attribution, "utm_campaign"))
        .bind(non_empty(&update.attribution, "utm_term"))
        .bind(non_empty(&update.attribution, "utm_content"))
        .fetch_one(&self.pool)
        .await
        .map_err(LedgerError::backend)?;

        Ok(row.into())
    }

    async fn set_banned(
        &self,
        address: &str,
        banned: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<VisitRecord>, LedgerError> {
        let row = sqlx::query_as::<_, VisitRow>(&format!(
            r#"
            UPDATE ip_tracking SET
                is_banned = $2,
                banned_at = CASE WHEN $2 THEN COALESCE(banned_at, $3) ELSE NULL END,
                unbanned_at = CASE WHEN $2 THEN unbanned_at ELSE $3 END,
                updated_at = NOW()
            WHERE ip_address = $1
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(address)
        .bind(banned)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(LedgerError::backend)?;

        Ok(row.map(VisitRecord::from))
    }

    async fn list_banned(&self) -> Result<Vec<VisitRecord>, LedgerError> {
        let rows = sqlx::query_as::<_, VisitRow>(&format!(
            "SELECT {} FROM ip_tracking WHERE is_banned ORDER BY banned_at DESC",
            RECORD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::backend)?;

        Ok(rows.into_iter().map(VisitRecord::from).collect())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(LedgerError::backend)?;
        Ok(())
    }
}

fn non_empty<'a>(attribution: &'a Attribution, field: &str) -> Option<&'a str> {
    attribution.get(field).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, DurationRound};
    use std::sync::Arc;

    // These tests need a scratch database and are skipped unless
    // TEST_DATABASE_URL is set.
    async fn test_store() -> Option<PgVisitStore> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = init_pool(&url, 20, Duration::from_secs(5)).ok()?;
        let report = run_migrations(&pool).await;
        assert!(report.is_clean(), "schema setup failed: {:?}", report);
        Some(PgVisitStore::new(pool))
    }

    async fn forget(store: &PgVisitStore, address: &str) {
        sqlx::query("DELETE FROM ip_tracking WHERE ip_address = $1")
            .bind(address)
            .execute(&store.pool)
            .await
            .unwrap();
    }

    fn visit(address: &str, now: DateTime<Utc>, attribution: Attribution) -> VisitUpdate {
        VisitUpdate {
            address: address.to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            attribution,
            now,
            ban_after: ChronoDuration::hours(4),
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc::now().duration_trunc(ChronoDuration::seconds(1)).unwrap()
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let Some(store) = test_store().await else { return };
        let report = run_migrations(&store.pool).await;
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_ban_transition_and_unban() {
        let Some(store) = test_store().await else { return };
        let address = "198.18.0.10";
        forget(&store, address).await;
        let t0 = base_time();

        let created = store.apply_visit(&visit(address, t0, Attribution::default())).await.unwrap();
        assert_eq!(created.visit_count, 1);
        assert!(!created.is_banned);

        let almost = t0 + ChronoDuration::milliseconds(4 * 3_600_000 - 3_600);
        let record = store.apply_visit(&visit(address, almost, Attribution::default())).await.unwrap();
        assert!(!record.is_banned);

        let crossing = t0 + ChronoDuration::hours(4);
        let record = store.apply_visit(&visit(address, crossing, Attribution::default())).await.unwrap();
        assert!(record.is_banned);
        assert_eq!(record.banned_at, Some(crossing));

        let later = t0 + ChronoDuration::hours(5);
        let record = store.apply_visit(&visit(address, later, Attribution::default())).await.unwrap();
        assert_eq!(record.banned_at, Some(crossing));
        assert_eq!(record.visit_count, 4);

        let unbanned = store.set_banned(address, false, later).await.unwrap().unwrap();
        assert!(!unbanned.is_banned);
        assert_eq!(unbanned.banned_at, None);

        let record = store
            .apply_visit(&visit(address, later + ChronoDuration::seconds(1), Attribution::default()))
            .await
            .unwrap();
        assert!(!record.is_banned);
        assert_eq!(record.first_seen_at, t0);
        assert_eq!(record.visit_count, 5);

        assert!(store.list_banned().await.unwrap().iter().all(|r| r.address != address));
        forget(&store, address).await;
    }

    #[tokio::test]
    async fn test_attribution_merge() {
        let Some(store) = test_store().await else { return };
        let address = "198.18.0.11";
        forget(&store, address).await;
        let t0 = base_time();

        store
            .apply_visit(&visit(address, t0, Attribution::from_pairs([("utm_source", "ads")])))
            .await
            .unwrap();
        let record = store
            .apply_visit(&visit(
                address,
                t0 + ChronoDuration::seconds(1),
                Attribution::from_pairs([("utm_campaign", "sale"), ("utm_source", "other")]),
            ))
            .await
            .unwrap();

        assert_eq!(record.attribution.utm_source.as_deref(), Some("ads"));
        assert_eq!(record.attribution.utm_campaign.as_deref(), Some("sale"));
        forget(&store, address).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_visits() {
        let Some(store) = test_store().await else { return };
        let store = Arc::new(store);
        let address = "198.18.0.12";
        forget(&store, address).await;
        let now = base_time();

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.apply_visit(&visit(address, now, Attribution::default())).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let record = store.find_by_address(address).await.unwrap().unwrap();
        assert_eq!(record.visit_count, 50);
        forget(&store, address).await;
    }
}
