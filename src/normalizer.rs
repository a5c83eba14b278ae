//! Event normalizer: the boundary between producer-defined telemetry
//! envelopes and the typed pipeline.
//!
//! Raw payloads arrive as arbitrary JSON and are canonicalized into a
//! [`StatusEvent`] here, or rejected as [`Error::MalformedEvent`], before any
//! business logic touches them. Rejection is final: malformed input is logged
//! and dropped, and resending correctly is the producer's responsibility.

use serde_json::Value;

use crate::error::Error;
use crate::model::{StatusEvent, UnitStatus};

/// Validate and canonicalize one raw inbound telemetry message.
///
/// Expected envelope:
/// `{"unitId": "...", "status": "occupied"|"free", "timestamp": <epoch secs>,
///   "heartbeat": <bool, optional>}`
///
/// A heartbeat message may omit `status`; it is normalized to carry the
/// unit's last known status forward so the stale-event rule and liveness
/// tracking apply uniformly. A heartbeat for a unit with no known state is
/// malformed: there is no status to carry.
///
/// Pure transformation, no side effects beyond validation.
pub fn normalize(raw: &Value, last_known: Option<UnitStatus>) -> Result<StatusEvent, Error> {
    let obj = raw
        .as_object()
        .ok_or_else(|| Error::MalformedEvent("payload is not a JSON object".to_string()))?;

    let unit_id = obj
        .get("unitId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::MalformedEvent("missing or empty unitId".to_string()))?;

    let timestamp = obj
        .get("timestamp")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::MalformedEvent("missing or non-integer timestamp".to_string()))?;
    if timestamp <= 0 {
        return Err(Error::MalformedEvent(format!(
            "timestamp must be positive epoch seconds, got {timestamp}"
        )));
    }

    let heartbeat = obj
        .get("heartbeat")
        .map(|v| {
            v.as_bool()
                .ok_or_else(|| Error::MalformedEvent("heartbeat must be a boolean".to_string()))
        })
        .transpose()?
        .unwrap_or(false);

    let status = match obj.get("status") {
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| Error::MalformedEvent("status must be a string".to_string()))?;
            UnitStatus::parse(s)
                .ok_or_else(|| Error::MalformedEvent(format!("unknown status \"{s}\"")))?
        }
        None if heartbeat => last_known.ok_or_else(|| {
            Error::MalformedEvent(format!(
                "heartbeat for unit {unit_id} with no known status"
            ))
        })?,
        None => {
            return Err(Error::MalformedEvent("missing status".to_string()));
        }
    };

    Ok(StatusEvent {
        unit_id: unit_id.to_string(),
        status,
        timestamp,
        heartbeat,
    })
}
