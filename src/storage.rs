//! SQLite storage layer for Vacancy.
//!
//! Holds every persistent structure of the pipeline:
//!
//! - `units`: provisioning projection (id, category, site, coordinates)
//! - `current_state`: one row per unit, the source of truth for "free now"
//! - `transitions`: append-only event log of real status flips
//! - `buckets`: fixed-width occupancy counters per (unit, bucket start)
//! - `bucket_applied`: de-duplication keys guarding bucket updates
//! - `subscriptions` / `alert_deliveries`: alert manager state
//!
//! Concurrency contract: `current_state` is only ever mutated through the
//! conditional writes below (guarded on the previously read timestamp), so
//! two racing observations for the same unit cannot both win. Bucket counters
//! only move through atomic upsert increments. Everything else is append-only
//! or single-owner.

use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::Result;
use crate::model::{
    AggregateBucket, AlertSubscription, CurrentState, SiteAvailability, TransitionRecord, Unit,
    UnitStatus,
};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

fn decode_status(s: &str) -> std::result::Result<UnitStatus, sqlx::Error> {
    UnitStatus::parse(s)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown status value: {s}").into()))
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:vacancy.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS units (
                unit_id TEXT PRIMARY KEY,
                category TEXT NOT NULL,
                site_id TEXT NOT NULL,
                lat REAL NOT NULL DEFAULT 0,
                lon REAL NOT NULL DEFAULT 0,
                display_name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS current_state (
                unit_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                last_status_ts INTEGER NOT NULL,
                last_transition_ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                unit_id TEXT NOT NULL,
                prev_status TEXT,
                new_status TEXT NOT NULL,
                ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for retention purges and per-unit history scans
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transitions_unit_ts
            ON transitions(unit_id, ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS buckets (
                unit_id TEXT NOT NULL,
                bucket_start INTEGER NOT NULL,
                free_count INTEGER NOT NULL DEFAULT 0,
                occupied_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (unit_id, bucket_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bucket_applied (
                transition_id INTEGER PRIMARY KEY
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subscriber_id TEXT NOT NULL,
                unit_id TEXT NOT NULL,
                created_ts INTEGER NOT NULL,
                expiry_ts INTEGER NOT NULL,
                quiet_start_hour INTEGER NOT NULL DEFAULT 0,
                quiet_end_hour INTEGER NOT NULL DEFAULT 0,
                last_fired_ts INTEGER,
                active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one active subscription per (subscriber, unit)
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_subscriptions_active_pair
            ON subscriptions(subscriber_id, unit_id) WHERE active = 1
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alert_deliveries (
                subscription_id INTEGER NOT NULL,
                transition_id INTEGER NOT NULL,
                fired_at INTEGER NOT NULL,
                PRIMARY KEY (subscription_id, transition_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Units
    // ------------------------------------------------------------------

    /// Insert or replace a unit's provisioning attributes.
    pub async fn upsert_unit(&self, unit: &Unit) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO units (unit_id, category, site_id, lat, lon, display_name)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(unit_id) DO UPDATE SET
                category = excluded.category,
                site_id = excluded.site_id,
                lat = excluded.lat,
                lon = excluded.lon,
                display_name = excluded.display_name
            "#,
        )
        .bind(&unit.unit_id)
        .bind(&unit.category)
        .bind(&unit.site_id)
        .bind(unit.lat)
        .bind(unit.lon)
        .bind(&unit.display_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_unit(&self, unit_id: &str) -> Result<Option<Unit>> {
        let row = sqlx::query(
            r#"
            SELECT unit_id, category, site_id, lat, lon, display_name
            FROM units WHERE unit_id = ?
            "#,
        )
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Unit {
            unit_id: r.get("unit_id"),
            category: r.get("category"),
            site_id: r.get("site_id"),
            lat: r.get("lat"),
            lon: r.get("lon"),
            display_name: r.get("display_name"),
        }))
    }

    // ------------------------------------------------------------------
    // Current state (per-unit conditional writes)
    // ------------------------------------------------------------------

    pub async fn get_current_state(&self, unit_id: &str) -> Result<Option<CurrentState>> {
        let row = sqlx::query(
            r#"
            SELECT unit_id, status, last_status_ts, last_transition_ts
            FROM current_state WHERE unit_id = ?
            "#,
        )
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let status: String = r.get("status");
                Ok(Some(CurrentState {
                    unit_id: r.get("unit_id"),
                    status: decode_status(&status)?,
                    last_status_ts: r.get("last_status_ts"),
                    last_transition_ts: r.get("last_transition_ts"),
                }))
            }
            None => Ok(None),
        }
    }

    /// First observation of a unit: insert the state row and append the
    /// transition record from the implicit unknown, in one transaction.
    ///
    /// Returns `None` when another writer created the row first, in which
    /// case the caller re-reads and retries. The state row and the event-log
    /// entry commit together; a failure rolls both back.
    pub async fn try_insert_state_with_record(
        &self,
        unit_id: &str,
        status: UnitStatus,
        ts: i64,
    ) -> Result<Option<TransitionRecord>> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO current_state
                (unit_id, status, last_status_ts, last_transition_ts)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(unit_id)
        .bind(status.as_str())
        .bind(ts)
        .bind(ts)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            tx.rollback().await?;
            return Ok(None);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO transitions (unit_id, prev_status, new_status, ts)
            VALUES (?, NULL, ?, ?)
            "#,
        )
        .bind(unit_id)
        .bind(status.as_str())
        .bind(ts)
        .execute(&mut *tx)
        .await?;

        let id = result.last_insert_rowid();
        tx.commit().await?;

        Ok(Some(TransitionRecord {
            id,
            unit_id: unit_id.to_string(),
            previous: None,
            new: status,
            ts,
        }))
    }

    /// Liveness refresh: advance `last_status_ts` without flipping status.
    ///
    /// Conditional on the timestamp previously read; returns `false` when a
    /// concurrent writer moved the row first.
    pub async fn try_refresh_liveness(
        &self,
        unit_id: &str,
        new_ts: i64,
        guard_ts: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE current_state
            SET last_status_ts = ?
            WHERE unit_id = ? AND last_status_ts = ?
            "#,
        )
        .bind(new_ts)
        .bind(unit_id)
        .bind(guard_ts)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Commit a real status flip and append its transition record, in one
    /// transaction guarded on the previously read timestamp.
    ///
    /// Returns `None` when a concurrent writer moved the row first. The state
    /// flip never lands without its event-log entry, and vice versa.
    pub async fn try_commit_transition_with_record(
        &self,
        unit_id: &str,
        previous: UnitStatus,
        new_status: UnitStatus,
        ts: i64,
        guard_ts: i64,
    ) -> Result<Option<TransitionRecord>> {
        let mut tx = self.pool.begin().await?;

        let flipped = sqlx::query(
            r#"
            UPDATE current_state
            SET status = ?, last_status_ts = ?, last_transition_ts = ?
            WHERE unit_id = ? AND last_status_ts = ?
            "#,
        )
        .bind(new_status.as_str())
        .bind(ts)
        .bind(ts)
        .bind(unit_id)
        .bind(guard_ts)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !flipped {
            tx.rollback().await?;
            return Ok(None);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO transitions (unit_id, prev_status, new_status, ts)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(unit_id)
        .bind(previous.as_str())
        .bind(new_status.as_str())
        .bind(ts)
        .execute(&mut *tx)
        .await?;

        let id = result.last_insert_rowid();
        tx.commit().await?;

        Ok(Some(TransitionRecord {
            id,
            unit_id: unit_id.to_string(),
            previous: Some(previous),
            new: new_status,
            ts,
        }))
    }

    // ------------------------------------------------------------------
    // Event log
    // ------------------------------------------------------------------

    /// Append a transition record and return the record with its id.
    pub async fn append_transition(
        &self,
        unit_id: &str,
        previous: Option<UnitStatus>,
        new: UnitStatus,
        ts: i64,
    ) -> Result<TransitionRecord> {
        let result = sqlx::query(
            r#"
            INSERT INTO transitions (unit_id, prev_status, new_status, ts)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(unit_id)
        .bind(previous.map(UnitStatus::as_str))
        .bind(new.as_str())
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(TransitionRecord {
            id: result.last_insert_rowid(),
            unit_id: unit_id.to_string(),
            previous,
            new,
            ts,
        })
    }

    /// Transition records for a unit inside [from, to), oldest first.
    pub async fn transitions_in_range(
        &self,
        unit_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<TransitionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, unit_id, prev_status, new_status, ts
            FROM transitions
            WHERE unit_id = ? AND ts >= ? AND ts < ?
            ORDER BY ts ASC
            "#,
        )
        .bind(unit_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| -> Result<TransitionRecord> {
                let previous: Option<String> = r.get("prev_status");
                let new: String = r.get("new_status");
                Ok(TransitionRecord {
                    id: r.get("id"),
                    unit_id: r.get("unit_id"),
                    previous: previous.as_deref().map(decode_status).transpose()?,
                    new: decode_status(&new)?,
                    ts: r.get("ts"),
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Aggregate buckets
    // ------------------------------------------------------------------

    /// Atomically add one observation of `status` to a unit's bucket,
    /// creating the bucket lazily on first touch.
    pub async fn increment_bucket(
        &self,
        unit_id: &str,
        bucket_start: i64,
        status: UnitStatus,
    ) -> Result<()> {
        let (free_inc, occ_inc) = match status {
            UnitStatus::Free => (1i64, 0i64),
            UnitStatus::Occupied => (0i64, 1i64),
        };

        sqlx::query(
            r#"
            INSERT INTO buckets (unit_id, bucket_start, free_count, occupied_count)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(unit_id, bucket_start) DO UPDATE SET
                free_count = free_count + excluded.free_count,
                occupied_count = occupied_count + excluded.occupied_count
            "#,
        )
        .bind(unit_id)
        .bind(bucket_start)
        .bind(free_inc)
        .bind(occ_inc)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Bucket increment guarded by a transition-id de-duplication key.
    ///
    /// Safe under at-least-once redelivery: the insert into `bucket_applied`
    /// and the counter update commit together, and a second application of
    /// the same transition id is a no-op. Returns whether this call applied.
    pub async fn apply_transition_to_bucket(
        &self,
        transition_id: i64,
        unit_id: &str,
        bucket_start: i64,
        status: UnitStatus,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            INSERT OR IGNORE INTO bucket_applied (transition_id) VALUES (?)
            "#,
        )
        .bind(transition_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !claimed {
            tx.rollback().await?;
            return Ok(false);
        }

        let (free_inc, occ_inc) = match status {
            UnitStatus::Free => (1i64, 0i64),
            UnitStatus::Occupied => (0i64, 1i64),
        };

        sqlx::query(
            r#"
            INSERT INTO buckets (unit_id, bucket_start, free_count, occupied_count)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(unit_id, bucket_start) DO UPDATE SET
                free_count = free_count + excluded.free_count,
                occupied_count = occupied_count + excluded.occupied_count
            "#,
        )
        .bind(unit_id)
        .bind(bucket_start)
        .bind(free_inc)
        .bind(occ_inc)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Buckets for one unit inside [from, to), oldest first.
    pub async fn bucket_history(
        &self,
        unit_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<AggregateBucket>> {
        let rows = sqlx::query(
            r#"
            SELECT bucket_start, free_count, occupied_count
            FROM buckets
            WHERE unit_id = ? AND bucket_start >= ? AND bucket_start < ?
            ORDER BY bucket_start ASC
            "#,
        )
        .bind(unit_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| AggregateBucket {
                bucket_start: r.get("bucket_start"),
                free_count: r.get("free_count"),
                occupied_count: r.get("occupied_count"),
            })
            .collect())
    }

    /// A single bucket by exact start, if it exists.
    pub async fn bucket_at(
        &self,
        unit_id: &str,
        bucket_start: i64,
    ) -> Result<Option<AggregateBucket>> {
        let row = sqlx::query(
            r#"
            SELECT bucket_start, free_count, occupied_count
            FROM buckets
            WHERE unit_id = ? AND bucket_start = ?
            "#,
        )
        .bind(unit_id)
        .bind(bucket_start)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| AggregateBucket {
            bucket_start: r.get("bucket_start"),
            free_count: r.get("free_count"),
            occupied_count: r.get("occupied_count"),
        }))
    }

    /// The newest non-empty bucket at or before `ts` (forecast fallback).
    pub async fn latest_bucket_before(
        &self,
        unit_id: &str,
        ts: i64,
    ) -> Result<Option<AggregateBucket>> {
        let row = sqlx::query(
            r#"
            SELECT bucket_start, free_count, occupied_count
            FROM buckets
            WHERE unit_id = ? AND bucket_start <= ?
            ORDER BY bucket_start DESC
            LIMIT 1
            "#,
        )
        .bind(unit_id)
        .bind(ts)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| AggregateBucket {
            bucket_start: r.get("bucket_start"),
            free_count: r.get("free_count"),
            occupied_count: r.get("occupied_count"),
        }))
    }

    /// Category/site rollup: constituent unit buckets summed per bucket
    /// start, oldest first. Never re-scans the raw event log.
    pub async fn category_rollup(
        &self,
        category: &str,
        site_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<AggregateBucket>> {
        let rows = sqlx::query(
            r#"
            SELECT b.bucket_start,
                   SUM(b.free_count) AS free_count,
                   SUM(b.occupied_count) AS occupied_count
            FROM buckets b
            JOIN units u ON u.unit_id = b.unit_id
            WHERE u.category = ? AND u.site_id = ?
              AND b.bucket_start >= ? AND b.bucket_start < ?
            GROUP BY b.bucket_start
            ORDER BY b.bucket_start ASC
            "#,
        )
        .bind(category)
        .bind(site_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| AggregateBucket {
                bucket_start: r.get("bucket_start"),
                free_count: r.get("free_count"),
                occupied_count: r.get("occupied_count"),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Availability projection
    // ------------------------------------------------------------------

    /// Free/total/offline counts for one (category, site); a read-only
    /// projection over `current_state` with the staleness rule applied.
    pub async fn site_availability(
        &self,
        category: &str,
        site_id: &str,
        now_ts: i64,
        liveness_window_secs: i64,
    ) -> Result<SiteAvailability> {
        let live_after = now_ts - liveness_window_secs;

        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN cs.status = 'free' AND cs.last_status_ts >= ?
                                  THEN 1 ELSE 0 END), 0) AS free,
                COALESCE(SUM(CASE WHEN cs.unit_id IS NULL OR cs.last_status_ts < ?
                                  THEN 1 ELSE 0 END), 0) AS offline
            FROM units u
            LEFT JOIN current_state cs ON cs.unit_id = u.unit_id
            WHERE u.category = ? AND u.site_id = ?
            "#,
        )
        .bind(live_after)
        .bind(live_after)
        .bind(category)
        .bind(site_id)
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get("total");
        let free: i64 = row.get("free");
        let offline: i64 = row.get("offline");

        Ok(SiteAvailability {
            site_id: site_id.to_string(),
            free: free as u32,
            total: total as u32,
            offline: offline as u32,
        })
    }

    // ------------------------------------------------------------------
    // Alert subscriptions
    // ------------------------------------------------------------------

    /// Create a subscription, replacing any prior active one for the same
    /// (subscriber, unit) pair.
    pub async fn create_subscription(
        &self,
        subscriber_id: &str,
        unit_id: &str,
        created_ts: i64,
        expiry_ts: i64,
        quiet_start_hour: u32,
        quiet_end_hour: u32,
    ) -> Result<AlertSubscription> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE subscriptions SET active = 0
            WHERE subscriber_id = ? AND unit_id = ? AND active = 1
            "#,
        )
        .bind(subscriber_id)
        .bind(unit_id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions
                (subscriber_id, unit_id, created_ts, expiry_ts,
                 quiet_start_hour, quiet_end_hour, active)
            VALUES (?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(subscriber_id)
        .bind(unit_id)
        .bind(created_ts)
        .bind(expiry_ts)
        .bind(quiet_start_hour)
        .bind(quiet_end_hour)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AlertSubscription {
            id: result.last_insert_rowid(),
            subscriber_id: subscriber_id.to_string(),
            unit_id: unit_id.to_string(),
            created_ts,
            expiry_ts,
            quiet_start_hour,
            quiet_end_hour,
            last_fired_ts: None,
            active: true,
        })
    }

    /// Deactivate a subscription by id. Returns whether it was active.
    pub async fn deactivate_subscription(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET active = 0 WHERE id = ? AND active = 1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_subscription(&self, id: i64) -> Result<Option<AlertSubscription>> {
        let row = sqlx::query(
            r#"
            SELECT id, subscriber_id, unit_id, created_ts, expiry_ts,
                   quiet_start_hour, quiet_end_hour, last_fired_ts, active
            FROM subscriptions WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(subscription_from_row))
    }

    /// All active subscriptions watching a unit.
    pub async fn active_subscriptions_for_unit(
        &self,
        unit_id: &str,
    ) -> Result<Vec<AlertSubscription>> {
        let rows = sqlx::query(
            r#"
            SELECT id, subscriber_id, unit_id, created_ts, expiry_ts,
                   quiet_start_hour, quiet_end_hour, last_fired_ts, active
            FROM subscriptions
            WHERE unit_id = ? AND active = 1
            ORDER BY id ASC
            "#,
        )
        .bind(unit_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(subscription_from_row).collect())
    }

    /// Claim the right to fire (subscription, transition) exactly once.
    ///
    /// The primary key on `alert_deliveries` makes this the serialization
    /// point for the no-double-fire guarantee; only the caller that actually
    /// inserted the row may deliver.
    pub async fn try_record_fire(
        &self,
        subscription_id: i64,
        transition_id: i64,
        fired_at: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO alert_deliveries
                (subscription_id, transition_id, fired_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(subscription_id)
        .bind(transition_id)
        .bind(fired_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Single-shot consumption: record the fire time and deactivate.
    pub async fn mark_subscription_fired(&self, id: i64, fired_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions SET last_fired_ts = ?, active = 0 WHERE id = ?
            "#,
        )
        .bind(fired_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Purge event-log records older than `cutoff_ts`. Bucket data remains
    /// the sole historical source past this point.
    pub async fn purge_transitions_before(&self, cutoff_ts: i64) -> Result<u64> {
        // Drop the dedup keys first so they cannot orphan
        sqlx::query(
            r#"
            DELETE FROM bucket_applied
            WHERE transition_id IN (SELECT id FROM transitions WHERE ts < ?)
            "#,
        )
        .bind(cutoff_ts)
        .execute(&self.pool)
        .await?;

        let result = sqlx::query(
            r#"
            DELETE FROM transitions WHERE ts < ?
            "#,
        )
        .bind(cutoff_ts)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Purge buckets that start before `cutoff_ts` (rolling horizon).
    pub async fn purge_buckets_before(&self, cutoff_ts: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM buckets WHERE bucket_start < ?
            "#,
        )
        .bind(cutoff_ts)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn subscription_from_row(r: sqlx::sqlite::SqliteRow) -> AlertSubscription {
    let active: i64 = r.get("active");
    AlertSubscription {
        id: r.get("id"),
        subscriber_id: r.get("subscriber_id"),
        unit_id: r.get("unit_id"),
        created_ts: r.get("created_ts"),
        expiry_ts: r.get("expiry_ts"),
        quiet_start_hour: r.get("quiet_start_hour"),
        quiet_end_hour: r.get("quiet_end_hour"),
        last_fired_ts: r.get("last_fired_ts"),
        active: active == 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> Storage {
        Storage::new("sqlite::memory:").await.unwrap()
    }

    fn unit(id: &str, site: &str) -> Unit {
        Unit {
            unit_id: id.to_string(),
            category: "treadmill".to_string(),
            site_id: site.to_string(),
            lat: 0.0,
            lon: 0.0,
            display_name: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_conditional_state_write_wins_once() {
        let storage = setup().await;

        let first = storage
            .try_insert_state_with_record("u1", UnitStatus::Occupied, 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.previous, None);
        assert_eq!(first.new, UnitStatus::Occupied);
        // Second insert loses
        assert!(
            storage
                .try_insert_state_with_record("u1", UnitStatus::Free, 100)
                .await
                .unwrap()
                .is_none()
        );

        // Guarded update with the right timestamp wins
        let flip = storage
            .try_commit_transition_with_record(
                "u1",
                UnitStatus::Occupied,
                UnitStatus::Free,
                200,
                100,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(flip.previous, Some(UnitStatus::Occupied));
        // Stale guard loses
        assert!(
            storage
                .try_commit_transition_with_record(
                    "u1",
                    UnitStatus::Free,
                    UnitStatus::Occupied,
                    300,
                    100,
                )
                .await
                .unwrap()
                .is_none()
        );

        let state = storage.get_current_state("u1").await.unwrap().unwrap();
        assert_eq!(state.status, UnitStatus::Free);
        assert_eq!(state.last_status_ts, 200);
        assert_eq!(state.last_transition_ts, 200);
    }

    #[tokio::test]
    async fn test_state_and_event_log_commit_together() {
        let storage = setup().await;

        storage
            .try_insert_state_with_record("u1", UnitStatus::Occupied, 100)
            .await
            .unwrap();
        storage
            .try_commit_transition_with_record("u1", UnitStatus::Occupied, UnitStatus::Free, 200, 100)
            .await
            .unwrap();
        // Losing writes must leave no stray log entries behind
        storage
            .try_commit_transition_with_record("u1", UnitStatus::Free, UnitStatus::Occupied, 250, 100)
            .await
            .unwrap();

        let log = storage.transitions_in_range("u1", 0, 1_000).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].ts, 100);
        assert_eq!(log[1].ts, 200);
        assert_eq!(log[1].new, UnitStatus::Free);

        let state = storage.get_current_state("u1").await.unwrap().unwrap();
        assert_eq!(state.last_transition_ts, log[1].ts);
    }

    #[tokio::test]
    async fn test_liveness_refresh_keeps_transition_ts() {
        let storage = setup().await;

        storage
            .try_insert_state_with_record("u1", UnitStatus::Occupied, 100)
            .await
            .unwrap();
        assert!(storage.try_refresh_liveness("u1", 150, 100).await.unwrap());

        let state = storage.get_current_state("u1").await.unwrap().unwrap();
        assert_eq!(state.last_status_ts, 150);
        assert_eq!(state.last_transition_ts, 100);
    }

    #[tokio::test]
    async fn test_transition_dedup_key_applies_once() {
        let storage = setup().await;

        let record = storage
            .append_transition("u1", Some(UnitStatus::Occupied), UnitStatus::Free, 1000)
            .await
            .unwrap();

        assert!(
            storage
                .apply_transition_to_bucket(record.id, "u1", 900, UnitStatus::Free)
                .await
                .unwrap()
        );
        // Redelivery is a no-op
        assert!(
            !storage
                .apply_transition_to_bucket(record.id, "u1", 900, UnitStatus::Free)
                .await
                .unwrap()
        );

        let bucket = storage.bucket_at("u1", 900).await.unwrap().unwrap();
        assert_eq!(bucket.free_count, 1);
        assert_eq!(bucket.occupied_count, 0);
    }

    #[tokio::test]
    async fn test_category_rollup_sums_units() {
        let storage = setup().await;

        storage.upsert_unit(&unit("u1", "site-a")).await.unwrap();
        storage.upsert_unit(&unit("u2", "site-a")).await.unwrap();
        storage.upsert_unit(&unit("u3", "site-b")).await.unwrap();

        storage
            .increment_bucket("u1", 900, UnitStatus::Free)
            .await
            .unwrap();
        storage
            .increment_bucket("u2", 900, UnitStatus::Occupied)
            .await
            .unwrap();
        storage
            .increment_bucket("u3", 900, UnitStatus::Occupied)
            .await
            .unwrap();

        let rollup = storage
            .category_rollup("treadmill", "site-a", 0, 1800)
            .await
            .unwrap();

        assert_eq!(rollup.len(), 1);
        assert_eq!(rollup[0].free_count, 1);
        assert_eq!(rollup[0].occupied_count, 1);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_active_pair() {
        let storage = setup().await;

        let first = storage
            .create_subscription("alice", "u1", 0, 1000, 0, 0)
            .await
            .unwrap();
        let second = storage
            .create_subscription("alice", "u1", 10, 2000, 0, 0)
            .await
            .unwrap();

        let old = storage.get_subscription(first.id).await.unwrap().unwrap();
        assert!(!old.active);

        let active = storage.active_subscriptions_for_unit("u1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
    }

    #[tokio::test]
    async fn test_fire_claim_is_exclusive() {
        let storage = setup().await;

        assert!(storage.try_record_fire(1, 42, 1000).await.unwrap());
        assert!(!storage.try_record_fire(1, 42, 1001).await.unwrap());
        // A different transition for the same subscription is a fresh claim
        assert!(storage.try_record_fire(1, 43, 1002).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_transitions_and_dedup_keys() {
        let storage = setup().await;

        let old = storage
            .append_transition("u1", None, UnitStatus::Occupied, 100)
            .await
            .unwrap();
        let recent = storage
            .append_transition("u1", Some(UnitStatus::Occupied), UnitStatus::Free, 5000)
            .await
            .unwrap();
        storage
            .apply_transition_to_bucket(old.id, "u1", 0, UnitStatus::Occupied)
            .await
            .unwrap();

        let purged = storage.purge_transitions_before(1000).await.unwrap();
        assert_eq!(purged, 1);

        let remaining = storage
            .transitions_in_range("u1", 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, recent.id);
    }

    #[tokio::test]
    async fn test_site_availability_counts_offline() {
        let storage = setup().await;

        storage.upsert_unit(&unit("u1", "site-a")).await.unwrap();
        storage.upsert_unit(&unit("u2", "site-a")).await.unwrap();
        storage.upsert_unit(&unit("u3", "site-a")).await.unwrap();

        // u1 free and live, u2 free but stale, u3 never observed
        storage
            .try_insert_state_with_record("u1", UnitStatus::Free, 1000)
            .await
            .unwrap();
        storage
            .try_insert_state_with_record("u2", UnitStatus::Free, 100)
            .await
            .unwrap();

        let avail = storage
            .site_availability("treadmill", "site-a", 1100, 300)
            .await
            .unwrap();

        assert_eq!(avail.total, 3);
        assert_eq!(avail.free, 1);
        assert_eq!(avail.offline, 2);
    }
}
