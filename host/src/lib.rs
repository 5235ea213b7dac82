//! GPU telemetry host: polls every device on a fixed interval and streams the
//! snapshots to WebSocket subscribers.
//!
//! leaves first: `hal` → `registry` → `sampler` → `subscribers` → `scheduler`
//! → `server`.

pub mod config;
pub mod domain;
pub mod hal;
pub mod history;
pub mod logging;
pub mod registry;
pub mod sampler;
pub mod scheduler;
pub mod server;
pub mod subscribers;
