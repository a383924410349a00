//! The request-lifecycle core: per-request deadline scheduling, worker
//! accounting, background-worker rendezvous, and the handful of supporting
//! pieces (API RPC concurrency limiting, CPU timing, CLI flags) a clone's
//! transport and servlet engine are driven through.
//!
//! Everything that actually moves bytes on or off the wire -- the RPC
//! transport, the servlet engine dispatching into application code -- is
//! out of scope; see [`transport::Transport`] and [`engine::ServletEngine`]
//! for the boundaries this crate expects something else to implement.

pub mod app_version;
pub mod clone_settings;
pub mod deadlock;
pub mod engine;
pub mod flags;
pub mod manager;
mod metrics;
pub mod request;
pub mod runner;
pub mod semaphore;
pub mod service;
pub mod state;
pub mod timer;
pub mod transport;

pub use manager::{
    RequestManager,
    RequestManagerConfig,
};
pub use request::{
    Request,
    RequestToken,
    RequestType,
};
pub use runner::RequestRunner;
pub use service::{
    AppInfo,
    DeadlineNotification,
    PerformanceData,
    RuntimeCoreService,
};
