//! Health state of a single pooled connection
//!
//! Status moves on consecutive results: `failure_threshold` failures in a row
//! mark a connection unhealthy, one success marks it healthy again.

use std::time::Instant;

/// Health status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Not checked yet
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug)]
pub struct ConnectionHealth {
    pub status: HealthStatus,
    consecutive_failures: u32,
    failure_threshold: u32,
    pub last_check: Option<Instant>,
    pub last_success: Option<Instant>,
    pub last_error: Option<String>,
}

impl ConnectionHealth {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            last_check: None,
            last_success: None,
            last_error: None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns true if status changed
    pub fn record_success(&mut self) -> bool {
        let now = Instant::now();
        self.last_check = Some(now);
        self.last_success = Some(now);
        self.last_error = None;
        self.consecutive_failures = 0;
        self.set_status(HealthStatus::Healthy)
    }

    /// Returns true if status changed
    pub fn record_failure(&mut self, error: impl Into<String>) -> bool {
        self.last_check = Some(Instant::now());
        self.last_error = Some(error.into());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.failure_threshold {
            self.set_status(HealthStatus::Unhealthy)
        } else {
            false
        }
    }

    fn set_status(&mut self, status: HealthStatus) -> bool {
        let changed = self.status != status;
        self.status = status;
        changed
    }
}
