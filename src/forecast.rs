//! Weekday/time-of-day seasonality forecast.
//!
//! A deliberate heuristic, not a model: the answer to "likely free soon" is
//! the mean occupancy ratio of the bucket matching the current weekday and
//! time of day across the last K weeks, compared against a fixed threshold.
//! With too few historical samples the forecast degrades to the most recent
//! single bucket's ratio and reports low confidence. The decision itself is
//! a pure function over bucket history so it can be tested in isolation.

use crate::config::Config;
use crate::error::Result;
use crate::model::{AggregateBucket, Confidence, Forecast, bucket_start_for};
use crate::storage::Storage;

const WEEK_SECS: i64 = 7 * 86_400;

/// Derive the forecast from matching historical buckets.
///
/// `matching` holds the non-empty buckets found at the same weekday and
/// time-of-day over the lookback window; `fallback` is the most recent
/// non-empty bucket of any kind, used when history is too thin.
pub fn assess(
    matching: &[AggregateBucket],
    fallback: Option<&AggregateBucket>,
    cfg: &Config,
) -> Forecast {
    let samples = matching.len() as u32;

    if samples >= cfg.forecast_min_samples {
        let mean = matching.iter().map(AggregateBucket::occupancy_ratio).sum::<f64>()
            / f64::from(samples);
        Forecast {
            likely_free: mean < cfg.forecast_free_threshold,
            confidence: Confidence::High,
            mean_occupancy_ratio: mean,
            samples,
        }
    } else {
        let ratio = fallback.map(AggregateBucket::occupancy_ratio).unwrap_or(0.0);
        Forecast {
            likely_free: ratio < cfg.forecast_free_threshold,
            confidence: Confidence::Low,
            mean_occupancy_ratio: ratio,
            samples,
        }
    }
}

/// Forecast for one unit at `now_ts`, reading the matching bucket from each
/// of the last `forecast_lookback_weeks` weeks.
pub async fn forecast_for_unit(
    storage: &Storage,
    unit_id: &str,
    now_ts: i64,
    cfg: &Config,
) -> Result<Forecast> {
    let current_start = bucket_start_for(now_ts, cfg.bucket_width_secs);

    let mut matching = Vec::new();
    for k in 1..=i64::from(cfg.forecast_lookback_weeks) {
        // Same weekday and time of day, k weeks back; the week length is a
        // multiple of any bucket width that divides a day
        if let Some(bucket) = storage.bucket_at(unit_id, current_start - k * WEEK_SECS).await? {
            if bucket.free_count + bucket.occupied_count > 0 {
                matching.push(bucket);
            }
        }
    }

    let fallback = storage.latest_bucket_before(unit_id, current_start).await?;

    Ok(assess(&matching, fallback.as_ref(), cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UnitStatus;

    fn bucket(start: i64, free: i64, occupied: i64) -> AggregateBucket {
        AggregateBucket {
            bucket_start: start,
            free_count: free,
            occupied_count: occupied,
        }
    }

    #[test]
    fn test_assess_likely_free_with_history() {
        let cfg = Config::default();
        // Three quiet weeks: ratio 0.25 each
        let matching = vec![bucket(0, 3, 1), bucket(1, 3, 1), bucket(2, 3, 1)];

        let forecast = assess(&matching, None, &cfg);
        assert!(forecast.likely_free);
        assert_eq!(forecast.confidence, Confidence::High);
        assert_eq!(forecast.samples, 3);
        assert!((forecast.mean_occupancy_ratio - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_assess_busy_with_history() {
        let cfg = Config::default();
        let matching = vec![bucket(0, 1, 9), bucket(1, 0, 10), bucket(2, 2, 8)];

        let forecast = assess(&matching, None, &cfg);
        assert!(!forecast.likely_free);
        assert_eq!(forecast.confidence, Confidence::High);
    }

    #[test]
    fn test_assess_thin_history_falls_back() {
        let cfg = Config::default();
        // Only two samples, below the default minimum of three
        let matching = vec![bucket(0, 0, 10), bucket(1, 0, 10)];
        let recent = bucket(100, 9, 1);

        let forecast = assess(&matching, Some(&recent), &cfg);
        assert_eq!(forecast.confidence, Confidence::Low);
        // The fallback ratio (0.1), not the busy history, drives the answer
        assert!(forecast.likely_free);
        assert_eq!(forecast.samples, 2);
    }

    #[test]
    fn test_assess_no_data_at_all() {
        let cfg = Config::default();

        let forecast = assess(&[], None, &cfg);
        assert_eq!(forecast.confidence, Confidence::Low);
        assert_eq!(forecast.samples, 0);
        assert_eq!(forecast.mean_occupancy_ratio, 0.0);
    }

    #[tokio::test]
    async fn test_forecast_reads_weekly_matching_buckets() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let cfg = Config::default();

        // Pick a reference time and populate the matching bucket for each of
        // the previous four weeks with mostly-free observations
        let now_ts = 10 * WEEK_SECS + 12 * 3600 + 100;
        let current_start = bucket_start_for(now_ts, cfg.bucket_width_secs);

        for k in 1..=4 {
            let start = current_start - k * WEEK_SECS;
            for _ in 0..3 {
                storage
                    .increment_bucket("u1", start, UnitStatus::Free)
                    .await
                    .unwrap();
            }
            storage
                .increment_bucket("u1", start, UnitStatus::Occupied)
                .await
                .unwrap();
        }

        let forecast = forecast_for_unit(&storage, "u1", now_ts, &cfg).await.unwrap();
        assert_eq!(forecast.samples, 4);
        assert_eq!(forecast.confidence, Confidence::High);
        assert!(forecast.likely_free);
    }

    #[tokio::test]
    async fn test_forecast_without_history_is_low_confidence() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let cfg = Config::default();

        let forecast = forecast_for_unit(&storage, "u1", 10 * WEEK_SECS, &cfg)
            .await
            .unwrap();
        assert_eq!(forecast.confidence, Confidence::Low);
        assert_eq!(forecast.samples, 0);
    }
}
