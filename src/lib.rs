// ABOUTME: Root library module for the drc daemons
// ABOUTME: Logging, metrics endpoint and the broker/host/spawn/watch commands built on drc-core and drc-process

pub mod daemon;
pub mod logging;
pub mod metrics_server;

// Re-export the substrate crates
pub use drc_core::config;
pub use drc_core::metrics;
pub use drc_core::paths;
pub use drc_core::Config;
