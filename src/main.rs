//! Vacancy - real-time equipment occupancy tracking.
//!
//! # API Endpoints
//!
//! - `POST /events` - Ingest one telemetry message
//! - `PUT /units/{id}` - Upsert a unit's provisioning attributes
//! - `GET /availability` - Per-site free/total counts for a category
//! - `GET /history/{unit}` - Bucketed usage history plus forecast
//! - `GET /rollup` - Category/site bucket rollup
//! - `POST /subscriptions` / `DELETE /subscriptions/{id}` - Free-up alerts
//! - `GET /health` - Health check

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use vacancy::api::{AppState, router};
use vacancy::config::Config;
use vacancy::notify::{LogNotifier, Notifier, WebhookNotifier};
use vacancy::storage::Storage;

/// Background retention loop: purges event-log records past the retention
/// window and buckets past the rolling horizon.
fn spawn_retention_purge(storage: Storage, config: Config) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(config.purge_interval_secs));
        loop {
            interval.tick().await;
            let now_ts = Utc::now().timestamp();

            let transition_cutoff = now_ts - config.transition_retention_days * 86_400;
            match storage.purge_transitions_before(transition_cutoff).await {
                Ok(purged) if purged > 0 => {
                    info!(purged, cutoff = transition_cutoff, "Purged old transitions");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Transition purge failed"),
            }

            let bucket_cutoff = now_ts - config.bucket_horizon_days * 86_400;
            match storage.purge_buckets_before(bucket_cutoff).await {
                Ok(purged) if purged > 0 => {
                    info!(purged, cutoff = bucket_cutoff, "Purged old buckets");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Bucket purge failed"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with environment filter
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("vacancy=info".parse()?))
        .init();

    let config = Config::from_env();
    info!(port = config.port, db_url = %config.database_url, "Starting Vacancy server");

    let storage = Storage::new(&config.database_url).await?;
    info!("Database initialized");

    let notifier: Arc<dyn Notifier> = match &config.webhook_url {
        Some(url) => {
            info!(url = %url, "Webhook notifier configured");
            Arc::new(WebhookNotifier::new(url, config.delivery_timeout_secs)?)
        }
        None => {
            info!("No webhook configured, alert fires will be logged only");
            Arc::new(LogNotifier)
        }
    };

    spawn_retention_purge(storage.clone(), config.clone());

    let state = AppState {
        storage,
        config: config.clone(),
        notifier,
    };

    let app = router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Vacancy is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
