//! Vacancy - real-time equipment occupancy tracking.
//!
//! # Overview
//!
//! Vacancy ingests per-unit occupancy telemetry from equipment sensors across
//! multiple sites, detects meaningful busy/free transitions exactly once,
//! maintains fixed-width time-bucketed usage statistics, and notifies
//! subscribers when a previously-busy unit frees up, with quiet hours and
//! cooldowns so nobody gets spammed.
//!
//! # Pipeline
//!
//! raw event → normalizer → transition detector → {state store, event log}
//! → aggregator → forecaster (on read); free transitions also feed the alert
//! manager → notifier.
//!
//! Per-unit ordering is defined by producer timestamps (stale events are
//! discarded), state commits use per-key optimistic concurrency, and both
//! bucket updates and alert fires are idempotent under redelivery.
//!
//! # Modules
//!
//! - [`model`]: Core data types and API payloads
//! - [`normalizer`]: Raw telemetry validation and canonicalization
//! - [`storage`]: SQLite storage layer
//! - [`pipeline`]: Transition detection and ingestion dispatch
//! - [`aggregation`]: Time-bucketed occupancy statistics
//! - [`forecast`]: Weekday/time-of-day "likely free" heuristic
//! - [`alerts`]: Subscriptions and the fire/suppress decision
//! - [`notify`]: Outbound delivery with bounded retry
//! - [`api`]: HTTP API handlers
//! - [`config`]: Environment-driven tunables
//! - [`error`]: Pipeline error taxonomy

pub mod aggregation;
pub mod alerts;
pub mod api;
pub mod config;
pub mod error;
pub mod forecast;
pub mod model;
pub mod normalizer;
pub mod notify;
pub mod pipeline;
pub mod storage;
