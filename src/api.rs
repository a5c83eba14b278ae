//! HTTP API handlers for Vacancy.
//!
//! - **POST /events**: inbound telemetry, the only write path into the
//!   pipeline. Malformed input is logged and dropped (400); a lost
//!   conditional-write race after bounded retries surfaces as 503 for
//!   producer retry.
//! - **GET /availability**: read-only free/total projection per site for the
//!   external recommendation feature.
//! - **GET /history/{unit}** and **GET /rollup**: bucketed usage statistics,
//!   the former with the forecast attached.
//! - **POST /subscriptions** / **DELETE /subscriptions/{id}**: free-up alert
//!   subscriptions.
//! - **PUT /units/{id}**: provisioning hook for the external device layer.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::aggregation;
use crate::alerts;
use crate::config::Config;
use crate::error::Error;
use crate::forecast;
use crate::model::{
    AvailabilityQuery, AvailabilityResponse, EventOutcomeResponse, HistoryQuery, HistoryResponse,
    RollupQuery, RollupResponse, SubscribeRequest, SubscribeResponse, Unit, UnitUpsertRequest,
};
use crate::notify::Notifier;
use crate::pipeline::{self, Outcome};
use crate::storage::Storage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub config: Config,
    pub notifier: Arc<dyn Notifier>,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(post_event))
        .route("/units/:unit_id", put(put_unit))
        .route("/availability", get(get_availability))
        .route("/history/:unit_id", get(get_history))
        .route("/rollup", get(get_rollup))
        .route("/subscriptions", post(post_subscription))
        .route("/subscriptions/:id", delete(delete_subscription))
        .route("/health", get(health_check))
        .with_state(state)
}

/// POST /events - Ingest one raw telemetry message.
///
/// # Request Body
///
/// ```json
/// {
///     "unitId": "treadmill-3",
///     "status": "free",
///     "timestamp": 1700000000,
///     "heartbeat": false
/// }
/// ```
///
/// # Response
///
/// `202 Accepted` with the pipeline outcome:
///
/// ```json
/// {"outcome": "transitioned", "previous": "occupied", "new": "free", "timestamp": 1700000000}
/// ```
///
/// or `{"outcome": "noop", "reason": "stale"}`.
#[instrument(skip(state, raw))]
pub async fn post_event(
    State(state): State<AppState>,
    Json(raw): Json<Value>,
) -> impl IntoResponse {
    match pipeline::ingest(&state.storage, &raw, &state.config, &state.notifier).await {
        Ok(Outcome::Transitioned(record)) => (
            StatusCode::ACCEPTED,
            Json(EventOutcomeResponse::Transitioned {
                previous: record.previous,
                new: record.new,
                timestamp: record.ts,
            }),
        )
            .into_response(),
        Ok(Outcome::NoOp(reason)) => (
            StatusCode::ACCEPTED,
            Json(EventOutcomeResponse::Noop {
                reason: reason.as_str().to_string(),
            }),
        )
            .into_response(),
        Err(Error::MalformedEvent(detail)) => {
            warn!(detail = %detail, "Malformed event dropped");
            StatusCode::BAD_REQUEST.into_response()
        }
        Err(Error::WriteConflict { unit_id, attempts }) => {
            warn!(
                unit_id = %unit_id,
                attempts,
                "Write conflict after bounded retries"
            );
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to ingest event");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// PUT /units/{id} - Upsert a unit's provisioning attributes.
#[instrument(skip(state, request))]
pub async fn put_unit(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
    Json(request): Json<UnitUpsertRequest>,
) -> impl IntoResponse {
    let unit = Unit {
        unit_id: unit_id.clone(),
        category: request.category,
        site_id: request.site_id,
        lat: request.lat,
        lon: request.lon,
        display_name: request.display_name,
    };

    match state.storage.upsert_unit(&unit).await {
        Ok(()) => {
            info!(unit_id = %unit_id, category = %unit.category, "Unit upserted");
            StatusCode::NO_CONTENT
        }
        Err(e) => {
            warn!(unit_id = %unit_id, error = %e, "Failed to upsert unit");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// GET /availability - Per-site free/total counts for a category.
///
/// # Query Parameters
///
/// - `category` (required)
/// - `sites` (required): comma-separated site ids
///
/// Units with no observation inside the liveness window count toward `total`
/// as `offline`, never as `free`.
#[instrument(skip(state))]
pub async fn get_availability(
    State(state): State<AppState>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityResponse>, StatusCode> {
    let now_ts = Utc::now().timestamp();

    let mut sites = Vec::new();
    for site_id in query.sites.split(',').filter(|s| !s.is_empty()) {
        match state
            .storage
            .site_availability(
                &query.category,
                site_id,
                now_ts,
                state.config.liveness_window_secs,
            )
            .await
        {
            Ok(availability) => sites.push(availability),
            Err(e) => {
                warn!(
                    category = %query.category,
                    site_id = %site_id,
                    error = %e,
                    "Failed to compute availability"
                );
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    }

    info!(
        category = %query.category,
        site_count = sites.len(),
        "Availability queried"
    );

    Ok(Json(AvailabilityResponse {
        category: query.category,
        sites,
    }))
}

/// GET /history/{unit} - Ordered buckets for a time range plus the forecast.
///
/// # Query Parameters
///
/// - `from` (required): range start, epoch seconds inclusive
/// - `to` (required): range end, epoch seconds exclusive
#[instrument(skip(state))]
pub async fn get_history(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, StatusCode> {
    let now_ts = Utc::now().timestamp();

    let buckets = match aggregation::history(&state.storage, &unit_id, query.from, query.to).await
    {
        Ok(buckets) => buckets,
        Err(e) => {
            warn!(unit_id = %unit_id, error = %e, "Failed to read bucket history");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let forecast =
        match forecast::forecast_for_unit(&state.storage, &unit_id, now_ts, &state.config).await {
            Ok(forecast) => forecast,
            Err(e) => {
                warn!(unit_id = %unit_id, error = %e, "Failed to compute forecast");
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

    info!(
        unit_id = %unit_id,
        bucket_count = buckets.len(),
        likely_free = forecast.likely_free,
        "History queried"
    );

    Ok(Json(HistoryResponse {
        unit_id,
        buckets,
        forecast,
    }))
}

/// GET /rollup - Category/site bucket rollup for a time range.
#[instrument(skip(state))]
pub async fn get_rollup(
    State(state): State<AppState>,
    Query(query): Query<RollupQuery>,
) -> Result<Json<RollupResponse>, StatusCode> {
    match aggregation::rollup(
        &state.storage,
        &query.category,
        &query.site,
        query.from,
        query.to,
    )
    .await
    {
        Ok(buckets) => {
            info!(
                category = %query.category,
                site_id = %query.site,
                bucket_count = buckets.len(),
                "Rollup queried"
            );
            Ok(Json(RollupResponse {
                category: query.category,
                site_id: query.site,
                buckets,
            }))
        }
        Err(e) => {
            warn!(
                category = %query.category,
                site_id = %query.site,
                error = %e,
                "Failed to compute rollup"
            );
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /subscriptions - Subscribe to a unit's next free-up.
///
/// # Request Body
///
/// ```json
/// {
///     "subscriber_id": "alice",
///     "unit_id": "treadmill-3",
///     "quiet_start_hour": 22,
///     "quiet_end_hour": 7
/// }
/// ```
///
/// Returns `201 Created` with the subscription id and computed expiry.
#[instrument(skip(state, request))]
pub async fn post_subscription(
    State(state): State<AppState>,
    Json(request): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<SubscribeResponse>), StatusCode> {
    let now_ts = Utc::now().timestamp();

    match alerts::subscribe(&state.storage, &request, &state.config, now_ts).await {
        Ok(response) => Ok((StatusCode::CREATED, Json(response))),
        Err(e) => {
            warn!(
                subscriber_id = %request.subscriber_id,
                unit_id = %request.unit_id,
                error = %e,
                "Failed to create subscription"
            );
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// DELETE /subscriptions/{id} - Cancel a subscription.
///
/// `204 No Content` when an active subscription was cancelled, `404` when no
/// active subscription exists under that id.
#[instrument(skip(state))]
pub async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> StatusCode {
    match alerts::unsubscribe(&state.storage, id).await {
        Ok(true) => {
            info!(subscription_id = id, "Subscription cancelled");
            StatusCode::NO_CONTENT
        }
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            warn!(subscription_id = id, error = %e, "Failed to cancel subscription");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
