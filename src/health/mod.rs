//! Health checks for pooled connections
//!
//! This module provides:
//! - Periodic pings of every master and sharding connection
//! - Unhealthy marking after consecutive failures
//! - Per-connection status snapshots

mod monitor;
mod state;

pub use monitor::{ConnectionStatus, HealthMonitor};
pub use state::{ConnectionHealth, HealthStatus};
