//! Data models for Vacancy.
//!
//! All timestamps on the ingestion path are producer-supplied Unix epoch
//! seconds. Per-unit ordering is defined by these source timestamps, never by
//! arrival order, so the types here carry raw `i64` seconds rather than
//! wall-clock types; conversion to calendar time happens only at the edges
//! (quiet hours, forecasting).

use serde::{Deserialize, Serialize};

/// The sensed status of a unit.
///
/// `Unknown` is deliberately not a variant: a unit with no recorded state has
/// no `CurrentState` row at all, and the first observation transitions it from
/// that implicit unknown (`previous = None` on the transition record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Occupied,
    Free,
}

impl UnitStatus {
    /// Parse the wire representation used by telemetry producers.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "occupied" => Some(UnitStatus::Occupied),
            "free" => Some(UnitStatus::Free),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Occupied => "occupied",
            UnitStatus::Free => "free",
        }
    }
}

/// A trackable equipment instance.
///
/// Created at provisioning time (external to this core); immutable here except
/// for its current-status projection. Coordinates exist for the external
/// routing feature and are passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub unit_id: String,
    /// Enumerated category tag, e.g. "treadmill" or "squat-rack".
    pub category: String,
    pub site_id: String,
    pub lat: f64,
    pub lon: f64,
    pub display_name: String,
}

/// One normalized telemetry observation.
///
/// Produced only by the event normalizer; business logic never sees raw
/// producer envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub unit_id: String,
    pub status: UnitStatus,
    /// Producer-supplied source timestamp (epoch seconds). Treated as
    /// non-decreasing per unit: anything at or before the stored timestamp is
    /// discarded as stale.
    pub timestamp: i64,
    /// Liveness-only message; the status was carried forward from the unit's
    /// last known state rather than observed.
    pub heartbeat: bool,
}

/// The state store's one record per unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentState {
    pub unit_id: String,
    pub status: UnitStatus,
    /// Timestamp of the newest accepted observation (liveness).
    pub last_status_ts: i64,
    /// Timestamp of the last real status flip. Lags `last_status_ts` while
    /// repeated same-status observations refresh liveness.
    pub last_transition_ts: i64,
}

impl CurrentState {
    /// A unit with no observation inside the liveness window reads as offline.
    /// The stored status is never mutated by staleness.
    pub fn is_offline(&self, now_ts: i64, liveness_window_secs: i64) -> bool {
        now_ts - self.last_status_ts > liveness_window_secs
    }
}

/// Append-only entry in the event log. Only real flips are recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub id: i64,
    pub unit_id: String,
    /// `None` for the first observation of a unit (implicit unknown).
    pub previous: Option<UnitStatus>,
    pub new: UnitStatus,
    pub ts: i64,
}

/// One fixed-width time bucket of occupancy counts for a unit (or, in rollup
/// reads, for a category/site combination).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateBucket {
    /// Bucket start (epoch seconds), always a multiple of the bucket width.
    pub bucket_start: i64,
    pub free_count: i64,
    pub occupied_count: i64,
}

impl AggregateBucket {
    /// Fraction of observations in this bucket that were `occupied`.
    /// An empty bucket reads as 0.0 (no evidence of use).
    pub fn occupancy_ratio(&self) -> f64 {
        let total = self.free_count + self.occupied_count;
        if total == 0 {
            0.0
        } else {
            self.occupied_count as f64 / total as f64
        }
    }
}

/// Map a timestamp to the start of its bucket.
pub fn bucket_start_for(ts: i64, bucket_width_secs: i64) -> i64 {
    ts.div_euclid(bucket_width_secs) * bucket_width_secs
}

/// A subscriber's request to be told when a specific unit frees up.
///
/// Single-shot: firing deactivates the subscription until the subscriber
/// re-subscribes. At most one active subscription exists per
/// (subscriber, unit) pair, enforced by the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertSubscription {
    pub id: i64,
    pub subscriber_id: String,
    pub unit_id: String,
    pub created_ts: i64,
    pub expiry_ts: i64,
    /// Daily quiet window in site-local hours, [start, end), wrapping midnight
    /// when start > end. start == end means no quiet hours.
    pub quiet_start_hour: u32,
    pub quiet_end_hour: u32,
    pub last_fired_ts: Option<i64>,
    pub active: bool,
}

impl AlertSubscription {
    /// Whether a site-local hour falls inside the quiet window.
    pub fn in_quiet_hours(&self, local_hour: u32) -> bool {
        in_quiet_window(self.quiet_start_hour, self.quiet_end_hour, local_hour)
    }
}

/// Quiet-window membership with midnight wrapping: [22, 7) covers 22:00
/// through 06:59 the next day. An empty window (start == end) never matches.
pub fn in_quiet_window(start_hour: u32, end_hour: u32, local_hour: u32) -> bool {
    if start_hour == end_hour {
        false
    } else if start_hour < end_hour {
        local_hour >= start_hour && local_hour < end_hour
    } else {
        local_hour >= start_hour || local_hour < end_hour
    }
}

/// Outbound message handed to the notifier when an alert fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertFire {
    pub subscription_id: i64,
    pub unit_id: String,
    /// Epoch seconds at fire time.
    pub fired_at: i64,
}

/// Confidence label attached to a forecast answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    High,
}

/// Answer to "is this unit likely to be free within the next N minutes".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Forecast {
    pub likely_free: bool,
    pub confidence: Confidence,
    /// Mean historical occupancy ratio the answer was derived from.
    pub mean_occupancy_ratio: f64,
    /// Number of historical buckets that contributed.
    pub samples: u32,
}

// ============================================================================
// API request/response types
// ============================================================================

/// Response body for POST /events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase", tag = "outcome")]
pub enum EventOutcomeResponse {
    Transitioned {
        previous: Option<UnitStatus>,
        new: UnitStatus,
        timestamp: i64,
    },
    Noop {
        reason: String,
    },
}

/// Request body for PUT /units/{id}.
#[derive(Debug, Clone, Deserialize)]
pub struct UnitUpsertRequest {
    pub category: String,
    pub site_id: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,
    pub display_name: String,
}

/// Query parameters for GET /availability.
#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub category: String,
    /// Comma-separated site ids.
    pub sites: String,
}

/// Free/total counts for one site.
#[derive(Debug, Clone, Serialize)]
pub struct SiteAvailability {
    pub site_id: String,
    pub free: u32,
    pub total: u32,
    /// Units with no observation inside the liveness window. Counted in
    /// `total` but never in `free`.
    pub offline: u32,
}

/// Response for GET /availability.
#[derive(Debug, Clone, Serialize)]
pub struct AvailabilityResponse {
    pub category: String,
    pub sites: Vec<SiteAvailability>,
}

/// Query parameters for GET /history/{unit}.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Range start (epoch seconds, inclusive).
    pub from: i64,
    /// Range end (epoch seconds, exclusive).
    pub to: i64,
}

/// Response for GET /history/{unit}.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub unit_id: String,
    pub buckets: Vec<AggregateBucket>,
    pub forecast: Forecast,
}

/// Query parameters for GET /rollup.
#[derive(Debug, Deserialize)]
pub struct RollupQuery {
    pub category: String,
    pub site: String,
    pub from: i64,
    pub to: i64,
}

/// Response for GET /rollup.
#[derive(Debug, Clone, Serialize)]
pub struct RollupResponse {
    pub category: String,
    pub site_id: String,
    pub buckets: Vec<AggregateBucket>,
}

/// Request body for POST /subscriptions.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub subscriber_id: String,
    pub unit_id: String,
    #[serde(default)]
    pub quiet_start_hour: u32,
    #[serde(default)]
    pub quiet_end_hour: u32,
}

/// Response for POST /subscriptions.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeResponse {
    pub subscription_id: i64,
    pub expiry_ts: i64,
}
