//! Aggregation of accepted observations into fixed-width occupancy buckets.
//!
//! Each accepted observation contributes exactly one count to the bucket its
//! source timestamp falls in. Transitions are applied idempotently through a
//! transition-id de-duplication key, so at-least-once redelivery never
//! double-counts; liveness refreshes and heartbeats are counted directly on
//! the accepted path, where the stale-event rule has already filtered
//! duplicates.
//!
//! Duration accounting across bucket boundaries uses the heartbeat
//! approximation: a unit that stays occupied across several buckets keeps
//! each intervening bucket populated as long as heartbeats arrive, so
//! idle-bucket occupancy ratios reflect heartbeat cadence rather than exact
//! dwell seconds.

use crate::error::Result;
use crate::model::{AggregateBucket, TransitionRecord, UnitStatus, bucket_start_for};
use crate::storage::Storage;

/// Count one accepted observation into its bucket.
pub async fn record_observation(
    storage: &Storage,
    unit_id: &str,
    status: UnitStatus,
    ts: i64,
    bucket_width_secs: i64,
) -> Result<()> {
    let bucket_start = bucket_start_for(ts, bucket_width_secs);
    storage.increment_bucket(unit_id, bucket_start, status).await
}

/// Apply one transition record to its bucket, exactly once per transition id.
///
/// Returns whether this call performed the update (`false` on redelivery).
pub async fn apply_transition(
    storage: &Storage,
    record: &TransitionRecord,
    bucket_width_secs: i64,
) -> Result<bool> {
    let bucket_start = bucket_start_for(record.ts, bucket_width_secs);
    storage
        .apply_transition_to_bucket(record.id, &record.unit_id, bucket_start, record.new)
        .await
}

/// Ordered bucket sequence (oldest first) for one unit over [from, to).
pub async fn history(
    storage: &Storage,
    unit_id: &str,
    from: i64,
    to: i64,
) -> Result<Vec<AggregateBucket>> {
    storage.bucket_history(unit_id, from, to).await
}

/// Category/site rollup over [from, to): constituent unit buckets summed per
/// bucket start, never re-derived from the raw event log.
pub async fn rollup(
    storage: &Storage,
    category: &str,
    site_id: &str,
    from: i64,
    to: i64,
) -> Result<Vec<AggregateBucket>> {
    storage.category_rollup(category, site_id, from, to).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> Storage {
        Storage::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_observations_land_in_their_buckets() {
        let storage = setup().await;

        // Two observations in bucket 0, one in bucket 900
        record_observation(&storage, "u1", UnitStatus::Occupied, 100, 900)
            .await
            .unwrap();
        record_observation(&storage, "u1", UnitStatus::Free, 850, 900)
            .await
            .unwrap();
        record_observation(&storage, "u1", UnitStatus::Occupied, 900, 900)
            .await
            .unwrap();

        let buckets = history(&storage, "u1", 0, 1800).await.unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket_start, 0);
        assert_eq!(buckets[0].free_count, 1);
        assert_eq!(buckets[0].occupied_count, 1);
        assert_eq!(buckets[1].bucket_start, 900);
        assert_eq!(buckets[1].occupied_count, 1);
    }

    #[tokio::test]
    async fn test_redelivered_transition_counts_once() {
        let storage = setup().await;

        let record = storage
            .append_transition("u1", Some(UnitStatus::Occupied), UnitStatus::Free, 1000)
            .await
            .unwrap();

        assert!(apply_transition(&storage, &record, 900).await.unwrap());
        assert!(!apply_transition(&storage, &record, 900).await.unwrap());

        let buckets = history(&storage, "u1", 0, 1800).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].free_count, 1);
    }

    #[tokio::test]
    async fn test_bucket_completeness() {
        let storage = setup().await;

        // 10 observations spread over several buckets; counts must sum to 10
        let mut free = 0i64;
        let mut occupied = 0i64;
        for i in 0..10 {
            let status = if i % 3 == 0 {
                free += 1;
                UnitStatus::Free
            } else {
                occupied += 1;
                UnitStatus::Occupied
            };
            record_observation(&storage, "u1", status, i * 400, 900)
                .await
                .unwrap();
        }

        let buckets = history(&storage, "u1", 0, 10 * 400 + 900).await.unwrap();
        let total_free: i64 = buckets.iter().map(|b| b.free_count).sum();
        let total_occupied: i64 = buckets.iter().map(|b| b.occupied_count).sum();
        assert_eq!(total_free, free);
        assert_eq!(total_occupied, occupied);
    }

    #[tokio::test]
    async fn test_history_ordering_and_range_bounds() {
        let storage = setup().await;

        for ts in [2700, 900, 1800, 0] {
            record_observation(&storage, "u1", UnitStatus::Free, ts, 900)
                .await
                .unwrap();
        }

        // [900, 2700) excludes the first and last buckets
        let buckets = history(&storage, "u1", 900, 2700).await.unwrap();
        let starts: Vec<i64> = buckets.iter().map(|b| b.bucket_start).collect();
        assert_eq!(starts, vec![900, 1800]);
    }
}
