//! sensord - per-host hardware telemetry daemon
//!
//! Polls local sensors into an in-memory history, evicts old samples, and
//! serves current readings and history over HTTP.

pub mod config;
pub mod hardware;
pub mod inspector;
pub mod retention;
pub mod routes;
pub mod server;
pub mod service;
pub mod store;

pub use hardware::SysinfoInspector;
pub use inspector::{CachedInspector, HardwareInspector};
pub use retention::{RetentionHandle, RetentionScheduler};
pub use server::AppState;
pub use service::OrchestrationService;
pub use store::{SampleStore, TelemetryStore};
