//! Background health checks for every pooled connection
//!
//! Each connection of both groups gets its own long-running task that pings
//! on a fixed interval after a random initial delay. Results only feed the
//! status table, logs and metrics; routing never consults them.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng as _;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthCheckConfig;
use crate::group::GroupManager;
use crate::metrics::metrics;
use crate::pool::{Connection, ConnectionError, GroupKind};

use super::state::{ConnectionHealth, HealthStatus};

type ConnectionKey = (GroupKind, u32);

/// Point-in-time health of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub group: GroupKind,
    pub shard_id: u32,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

pub struct HealthMonitor {
    manager: Arc<GroupManager>,
    config: HealthCheckConfig,
    states: DashMap<ConnectionKey, Arc<RwLock<ConnectionHealth>>>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<GroupManager>, config: HealthCheckConfig) -> Self {
        let states = DashMap::new();
        for conn in manager.connections() {
            states.insert(
                (conn.group(), conn.shard_id()),
                Arc::new(RwLock::new(ConnectionHealth::new(config.failure_threshold))),
            );
        }
        Self {
            manager,
            config,
            states,
        }
    }

    /// Spawn one check task per connection; the handle resolves once all of
    /// them observed `cancel`
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                debug!("Health checks disabled");
                return;
            }

            let mut tasks = JoinSet::new();
            for conn in self.manager.connections() {
                tasks.spawn(Arc::clone(&self).watch(Arc::clone(conn), cancel.clone()));
            }
            info!(
                connections = tasks.len(),
                interval_ms = self.config.check_interval_ms,
                "Health monitor started"
            );

            while tasks.join_next().await.is_some() {}
            info!("Health monitor stopped");
        })
    }

    async fn watch(self: Arc<Self>, conn: Arc<Connection>, cancel: CancellationToken) {
        let interval = Duration::from_millis(self.config.check_interval_ms.max(1));

        // Random initial delay to stagger checks (0-100% of interval)
        let stagger = rand::thread_rng().gen_range(0..interval.as_millis() as u64);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(stagger)) => {}
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(
                        group = %conn.group(),
                        shard_id = conn.shard_id(),
                        "Health check task cancelled"
                    );
                    break;
                }
                _ = ticker.tick() => {
                    self.check(&conn).await;
                }
            }
        }
    }

    /// Run one round of checks over every connection
    pub async fn check_all(&self) {
        futures::future::join_all(self.manager.connections().map(|conn| self.check(conn))).await;
    }

    async fn check(&self, conn: &Connection) {
        let timeout = Duration::from_millis(self.config.check_timeout_ms);
        let result = conn.ping_within(timeout).await;

        let Some(health) = self
            .states
            .get(&(conn.group(), conn.shard_id()))
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };

        match result {
            Ok(()) => {
                metrics().record_health_check("success");
                let mut h = health.write();
                if h.record_success() {
                    info!(
                        group = %conn.group(),
                        shard_id = conn.shard_id(),
                        status = h.status.as_str(),
                        "Connection status changed"
                    );
                } else {
                    debug!(
                        group = %conn.group(),
                        shard_id = conn.shard_id(),
                        "Health check passed"
                    );
                }
            }
            Err(e) => {
                let label = match e {
                    ConnectionError::PingTimeout { .. } => "timeout",
                    _ => "failure",
                };
                metrics().record_health_check(label);
                let mut h = health.write();
                if h.record_failure(e.to_string()) {
                    warn!(
                        group = %conn.group(),
                        shard_id = conn.shard_id(),
                        failures = h.consecutive_failures(),
                        error = %e,
                        "Connection status changed to unhealthy"
                    );
                } else {
                    debug!(
                        group = %conn.group(),
                        shard_id = conn.shard_id(),
                        error = %e,
                        "Health check failed"
                    );
                }
            }
        }

        self.publish_counts();
    }

    fn publish_counts(&self) {
        let (mut healthy, mut unhealthy) = (0, 0);
        for entry in self.states.iter() {
            match entry.value().read().status {
                HealthStatus::Healthy => healthy += 1,
                HealthStatus::Unhealthy => unhealthy += 1,
                HealthStatus::Unknown => {}
            }
        }
        metrics().set_health_connections(healthy, unhealthy);
    }

    pub fn status(&self, group: GroupKind, shard_id: u32) -> Option<HealthStatus> {
        self.states
            .get(&(group, shard_id))
            .map(|entry| entry.value().read().status)
    }

    /// Health of every connection, master first then shards by id
    pub fn snapshot(&self) -> Vec<ConnectionStatus> {
        let mut statuses: Vec<ConnectionStatus> = self
            .states
            .iter()
            .map(|entry| {
                let (group, shard_id) = *entry.key();
                let h = entry.value().read();
                ConnectionStatus {
                    group,
                    shard_id,
                    status: h.status,
                    consecutive_failures: h.consecutive_failures(),
                    last_error: h.last_error.clone(),
                }
            })
            .collect();
        statuses.sort_by_key(|s| (s.group == GroupKind::Sharding, s.shard_id));
        statuses
    }
}
