//! The ingestion pipeline: transition detection and dispatch.
//!
//! One normalized [`StatusEvent`] goes in; the outcome is either a no-op
//! (stale, duplicate, liveness refresh, debounced flap) or a committed
//! transition. State commits use optimistic concurrency per unit key: read,
//! compare, conditionally write, and retry a bounded number of times with
//! jittered backoff when a concurrent observation for the same unit wins the
//! race. Events for different units never contend.
//!
//! Alert evaluation runs on a spawned task after the commit and is
//! best-effort: its failures are logged and never propagated to the
//! ingestion caller, so slow webhook deliveries never stall ingestion and
//! the authoritative state update stays at-most-once-per-transition.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::aggregation;
use crate::alerts;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{StatusEvent, TransitionRecord, UnitStatus};
use crate::normalizer;
use crate::notify::Notifier;
use crate::storage::Storage;

/// Why an event produced no transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// Timestamp at or before the stored state; discarded by design.
    Stale,
    /// Same status as stored; only the liveness timestamp advanced.
    Refreshed,
    /// A reversal inside the configured minimum dwell window; suppressed,
    /// liveness still advanced.
    Debounced,
}

impl NoOpReason {
    pub fn as_str(self) -> &'static str {
        match self {
            NoOpReason::Stale => "stale",
            NoOpReason::Refreshed => "refreshed",
            NoOpReason::Debounced => "debounced",
        }
    }
}

/// Result of running one event through the transition detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    NoOp(NoOpReason),
    Transitioned(TransitionRecord),
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = 10u64 << attempt.min(6);
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter_ms)
}

/// Run one normalized event through the read-compare-write cycle.
///
/// Surfaces [`Error::WriteConflict`] only after `write_retry_attempts`
/// consecutive lost races, for upstream retry.
pub async fn detect(storage: &Storage, event: &StatusEvent, cfg: &Config) -> Result<Outcome> {
    for attempt in 0..cfg.write_retry_attempts {
        match storage.get_current_state(&event.unit_id).await? {
            None => {
                // First observation: transitions from the implicit unknown.
                // State row and event-log entry commit in one transaction.
                if let Some(record) = storage
                    .try_insert_state_with_record(&event.unit_id, event.status, event.timestamp)
                    .await?
                {
                    return Ok(Outcome::Transitioned(record));
                }
                // Lost the insert race; re-read and retry
            }
            Some(state) => {
                if event.timestamp <= state.last_status_ts {
                    return Ok(Outcome::NoOp(NoOpReason::Stale));
                }

                if event.status == state.status {
                    if storage
                        .try_refresh_liveness(&event.unit_id, event.timestamp, state.last_status_ts)
                        .await?
                    {
                        return Ok(Outcome::NoOp(NoOpReason::Refreshed));
                    }
                } else if cfg.min_dwell_secs > 0
                    && event.timestamp - state.last_transition_ts < cfg.min_dwell_secs
                {
                    // Flap inside the dwell window: keep the stored status,
                    // still count the observation as liveness
                    if storage
                        .try_refresh_liveness(&event.unit_id, event.timestamp, state.last_status_ts)
                        .await?
                    {
                        return Ok(Outcome::NoOp(NoOpReason::Debounced));
                    }
                } else if let Some(record) = storage
                    .try_commit_transition_with_record(
                        &event.unit_id,
                        state.status,
                        event.status,
                        event.timestamp,
                        state.last_status_ts,
                    )
                    .await?
                {
                    return Ok(Outcome::Transitioned(record));
                }
            }
        }

        if attempt + 1 < cfg.write_retry_attempts {
            debug!(
                unit_id = %event.unit_id,
                attempt,
                "Conditional write lost, retrying"
            );
            tokio::time::sleep(backoff_with_jitter(attempt)).await;
        }
    }

    Err(Error::WriteConflict {
        unit_id: event.unit_id.clone(),
        attempts: cfg.write_retry_attempts,
    })
}

/// Full ingestion path for one raw telemetry message: normalize, detect,
/// aggregate, then hand alert evaluation to a background task.
pub async fn ingest(
    storage: &Storage,
    raw: &Value,
    cfg: &Config,
    notifier: &Arc<dyn Notifier>,
) -> Result<Outcome> {
    // Heartbeats carry the unit's last known status forward, so the
    // normalizer needs the stored state before validation completes
    let last_known = match raw.get("unitId").and_then(Value::as_str) {
        Some(unit_id) => storage.get_current_state(unit_id).await?.map(|s| s.status),
        None => None,
    };

    let event = normalizer::normalize(raw, last_known)?;
    let outcome = detect(storage, &event, cfg).await?;

    match &outcome {
        Outcome::Transitioned(record) => {
            info!(
                unit_id = %record.unit_id,
                previous = ?record.previous.map(UnitStatus::as_str),
                new = record.new.as_str(),
                ts = record.ts,
                "Transition recorded"
            );

            aggregation::apply_transition(storage, record, cfg.bucket_width_secs).await?;

            if record.new == UnitStatus::Free {
                // Webhook retries can take seconds; the evaluation runs on
                // its own task so the ingestion caller returns at commit
                let storage = storage.clone();
                let record = record.clone();
                let cfg = cfg.clone();
                let notifier = Arc::clone(notifier);
                tokio::spawn(async move {
                    if let Err(e) =
                        alerts::evaluate_free_transition(&storage, &record, &cfg, &notifier).await
                    {
                        warn!(
                            unit_id = %record.unit_id,
                            transition_id = record.id,
                            error = %e,
                            "Alert evaluation failed"
                        );
                    }
                });
            }
        }
        Outcome::NoOp(reason) => {
            debug!(
                unit_id = %event.unit_id,
                reason = reason.as_str(),
                ts = event.timestamp,
                "Event produced no transition"
            );

            // Accepted observations still feed bucket coverage; stale ones
            // were never accepted
            if matches!(reason, NoOpReason::Refreshed | NoOpReason::Debounced) {
                aggregation::record_observation(
                    storage,
                    &event.unit_id,
                    event.status,
                    event.timestamp,
                    cfg.bucket_width_secs,
                )
                .await?;
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::LogNotifier;
    use serde_json::json;

    async fn setup() -> (Storage, Config, Arc<dyn Notifier>) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let cfg = Config::default();
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        (storage, cfg, notifier)
    }

    fn event(unit: &str, status: UnitStatus, ts: i64) -> StatusEvent {
        StatusEvent {
            unit_id: unit.to_string(),
            status,
            timestamp: ts,
            heartbeat: false,
        }
    }

    #[tokio::test]
    async fn test_first_observation_transitions_from_unknown() {
        let (storage, cfg, _) = setup().await;

        let outcome = detect(&storage, &event("u1", UnitStatus::Occupied, 100), &cfg)
            .await
            .unwrap();

        match outcome {
            Outcome::Transitioned(record) => {
                assert_eq!(record.previous, None);
                assert_eq!(record.new, UnitStatus::Occupied);
                assert_eq!(record.ts, 100);
            }
            other => panic!("expected transition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_flip_records_transition() {
        let (storage, cfg, _) = setup().await;

        detect(&storage, &event("u1", UnitStatus::Occupied, 100), &cfg)
            .await
            .unwrap();
        let outcome = detect(&storage, &event("u1", UnitStatus::Free, 200), &cfg)
            .await
            .unwrap();

        match outcome {
            Outcome::Transitioned(record) => {
                assert_eq!(record.previous, Some(UnitStatus::Occupied));
                assert_eq!(record.new, UnitStatus::Free);
            }
            other => panic!("expected transition, got {other:?}"),
        }

        let state = storage.get_current_state("u1").await.unwrap().unwrap();
        assert_eq!(state.status, UnitStatus::Free);
        assert_eq!(state.last_transition_ts, 200);
    }

    #[tokio::test]
    async fn test_duplicate_event_is_stale_noop() {
        let (storage, cfg, _) = setup().await;

        detect(&storage, &event("u1", UnitStatus::Free, 100), &cfg)
            .await
            .unwrap();
        // Identical redelivery
        let outcome = detect(&storage, &event("u1", UnitStatus::Free, 100), &cfg)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NoOp(NoOpReason::Stale));

        // No second transition record
        let records = storage.transitions_in_range("u1", 0, 1000).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_events_preserve_newer_state() {
        let (storage, cfg, _) = setup().await;

        // t=50 free arrives first, then t=30 occupied
        detect(&storage, &event("u1", UnitStatus::Free, 50), &cfg)
            .await
            .unwrap();
        let outcome = detect(&storage, &event("u1", UnitStatus::Occupied, 30), &cfg)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NoOp(NoOpReason::Stale));

        let state = storage.get_current_state("u1").await.unwrap().unwrap();
        assert_eq!(state.status, UnitStatus::Free);
        assert_eq!(state.last_status_ts, 50);
    }

    #[tokio::test]
    async fn test_same_status_refreshes_liveness_only() {
        let (storage, cfg, _) = setup().await;

        detect(&storage, &event("u1", UnitStatus::Occupied, 100), &cfg)
            .await
            .unwrap();
        let outcome = detect(&storage, &event("u1", UnitStatus::Occupied, 160), &cfg)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NoOp(NoOpReason::Refreshed));

        let state = storage.get_current_state("u1").await.unwrap().unwrap();
        assert_eq!(state.last_status_ts, 160);
        assert_eq!(state.last_transition_ts, 100);
    }

    #[tokio::test]
    async fn test_debounce_suppresses_fast_reversal() {
        let (storage, _, _) = setup().await;
        let cfg = Config {
            min_dwell_secs: 30,
            ..Config::default()
        };

        detect(&storage, &event("u1", UnitStatus::Occupied, 100), &cfg)
            .await
            .unwrap();
        detect(&storage, &event("u1", UnitStatus::Free, 200), &cfg)
            .await
            .unwrap();

        // Reversal 10s after the flip: suppressed
        let outcome = detect(&storage, &event("u1", UnitStatus::Occupied, 210), &cfg)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::NoOp(NoOpReason::Debounced));

        let state = storage.get_current_state("u1").await.unwrap().unwrap();
        assert_eq!(state.status, UnitStatus::Free);
        assert_eq!(state.last_status_ts, 210);

        // Past the dwell window the reversal is real
        let outcome = detect(&storage, &event("u1", UnitStatus::Occupied, 260), &cfg)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Transitioned(_)));
    }

    #[tokio::test]
    async fn test_timestamp_order_determines_final_state() {
        // Same events, two interleavings that preserve relative timestamp
        // order per unit, same final state
        let events = [
            event("u1", UnitStatus::Occupied, 10),
            event("u1", UnitStatus::Free, 20),
            event("u1", UnitStatus::Occupied, 30),
        ];

        for order in [[0usize, 1, 2], [0, 2, 1]] {
            let (storage, cfg, _) = setup().await;
            for i in order {
                let _ = detect(&storage, &events[i], &cfg).await.unwrap();
            }
            let state = storage.get_current_state("u1").await.unwrap().unwrap();
            assert_eq!(state.status, UnitStatus::Occupied);
            assert_eq!(state.last_status_ts, 30);
        }
    }

    #[tokio::test]
    async fn test_ingest_counts_accepted_observations() {
        let (storage, cfg, notifier) = setup().await;

        let transition = json!({"unitId": "u1", "status": "occupied", "timestamp": 100});
        let refresh = json!({"unitId": "u1", "status": "occupied", "timestamp": 200});
        let heartbeat = json!({"unitId": "u1", "timestamp": 300, "heartbeat": true});
        let stale = json!({"unitId": "u1", "status": "free", "timestamp": 50});

        ingest(&storage, &transition, &cfg, &notifier).await.unwrap();
        ingest(&storage, &refresh, &cfg, &notifier).await.unwrap();
        ingest(&storage, &heartbeat, &cfg, &notifier).await.unwrap();
        ingest(&storage, &stale, &cfg, &notifier).await.unwrap();

        // Three accepted observations, all in the first bucket
        let buckets = storage.bucket_history("u1", 0, 900).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].free_count + buckets[0].occupied_count, 3);
        assert_eq!(buckets[0].occupied_count, 3);
    }

    #[tokio::test]
    async fn test_slow_delivery_does_not_stall_ingestion() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::time::Instant;

        use crate::model::AlertFire;

        struct SlowNotifier {
            delivered: AtomicU32,
        }

        #[async_trait::async_trait]
        impl Notifier for SlowNotifier {
            async fn deliver(&self, _fire: &AlertFire) -> anyhow::Result<()> {
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let (storage, cfg, _) = setup().await;
        let slow = Arc::new(SlowNotifier {
            delivered: AtomicU32::new(0),
        });
        let notifier: Arc<dyn Notifier> = slow.clone();

        storage
            .create_subscription("s1", "u1", 100, 10_000, 0, 0)
            .await
            .unwrap();

        let occupied = json!({"unitId": "u1", "status": "occupied", "timestamp": 100});
        ingest(&storage, &occupied, &cfg, &notifier).await.unwrap();

        let free = json!({"unitId": "u1", "status": "free", "timestamp": 200});
        let started = Instant::now();
        ingest(&storage, &free, &cfg, &notifier).await.unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(250),
            "ingestion waited on delivery"
        );

        // The handed-off delivery still completes
        for _ in 0..100 {
            if slow.delivered.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("delivery never completed");
    }

    #[tokio::test]
    async fn test_ingest_rejects_malformed() {
        let (storage, cfg, notifier) = setup().await;

        let raw = json!({"unitId": "u1", "status": "broken", "timestamp": 100});
        let result = ingest(&storage, &raw, &cfg, &notifier).await;
        assert!(matches!(result, Err(Error::MalformedEvent(_))));

        // Nothing was stored
        assert!(storage.get_current_state("u1").await.unwrap().is_none());
    }
}
