//! Error taxonomy for the ingestion and alert pipeline.
//!
//! Stale events and expired subscriptions are deliberately not errors: both
//! are resolved as no-op outcomes inside the pipeline and never surface to
//! callers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad inbound telemetry. Dropped and logged; the producer is responsible
    /// for resending a corrected message.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// The per-unit conditional write lost every retry attempt. Transient;
    /// the caller may resubmit the event.
    #[error("write conflict on unit {unit_id} after {attempts} attempts")]
    WriteConflict { unit_id: String, attempts: u32 },

    /// Notification delivery exhausted its retries. Logged and dropped; there
    /// is no persistent alert queue in this core.
    #[error("alert delivery failed for subscription {subscription_id}")]
    DeliveryFailed { subscription_id: i64 },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
