//! Telemetry metrics aggregation pipeline.
//!
//! Events enter through [`service::Service::handle_event`], fold into
//! per-identity aggregates at minute, hour and day granularity, and
//! leave through a batched write queue toward a unit-per-day document
//! store. Unit lifecycle (rollover, retention, day compression) runs
//! alongside as periodic maintenance.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod health;
pub mod metric;
pub mod queue;
pub mod schema;
pub mod service;
pub mod storage;
