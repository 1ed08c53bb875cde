use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Connection as _};
use tracing::{debug, error};

use crate::config::{DatabaseConfig, Driver};
use crate::retry::Transient;

/// Timeout for the liveness check performed on open and by `ping`
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Group a connection belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    Master,
    Sharding,
}

impl GroupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::Master => "master",
            GroupKind::Sharding => "sharding",
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool tuning applied to one physical database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_open: u32,
    pub max_idle: u32,
    pub max_lifetime: Duration,
}

impl From<&DatabaseConfig> for PoolSettings {
    fn from(config: &DatabaseConfig) -> Self {
        let max_open = config.max_connections.max(1);
        Self {
            max_open,
            max_idle: config.max_idle_connections.min(max_open),
            max_lifetime: config.connection_max_lifetime(),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Open physical sessions (idle + in use)
    pub size: u32,
    pub idle: usize,
}

/// One physical database handle and its connection pool
///
/// Created once at startup and shared (behind `Arc`) by every request.
pub struct Connection {
    pool: AnyPool,
    shard_id: u32,
    driver: Driver,
    group: GroupKind,
    settings: PoolSettings,
    closed: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("group", &self.group)
            .field("shard_id", &self.shard_id)
            .field("driver", &self.driver)
            .field("settings", &self.settings)
            .finish()
    }
}

impl Connection {
    /// Open a pool for a database and verify it with a bounded ping
    ///
    /// On ping failure the pool is closed before the error is returned.
    pub async fn open(config: &DatabaseConfig, group: GroupKind) -> Result<Self, ConnectionError> {
        sqlx::any::install_default_drivers();

        let dsn = config.dsn().map_err(|e| ConnectionError::InvalidDsn {
            group,
            shard_id: config.id,
            reason: e.to_string(),
        })?;
        let settings = PoolSettings::from(config);

        debug!(
            group = %group,
            shard_id = config.id,
            driver = config.driver.as_str(),
            "Opening database pool"
        );

        // idle connections above min_connections are reaped after idle_timeout
        let pool = AnyPoolOptions::new()
            .max_connections(settings.max_open)
            .min_connections(settings.max_idle)
            .max_lifetime(settings.max_lifetime)
            .idle_timeout(Duration::from_secs(300))
            .acquire_timeout(PING_TIMEOUT)
            .connect_lazy(&dsn)
            .map_err(|e| ConnectionError::InvalidDsn {
                group,
                shard_id: config.id,
                reason: e.to_string(),
            })?;

        let conn = Self {
            pool,
            shard_id: config.id,
            driver: config.driver,
            group,
            settings,
            closed: AtomicBool::new(false),
        };

        if let Err(e) = conn.ping().await {
            error!(group = %group, shard_id = config.id, error = %e, "Initial ping failed");
            conn.close().await;
            return Err(e);
        }

        Ok(conn)
    }

    /// Liveness check bounded by `PING_TIMEOUT`
    pub async fn ping(&self) -> Result<(), ConnectionError> {
        self.ping_within(PING_TIMEOUT).await
    }

    /// Liveness check with a caller-chosen timeout
    pub async fn ping_within(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let check = async {
            let mut conn = self.pool.acquire().await?;
            conn.ping().await
        };

        match tokio::time::timeout(timeout, check).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(ConnectionError::Ping {
                group: self.group,
                shard_id: self.shard_id,
                source,
            }),
            Err(_) => Err(ConnectionError::PingTimeout {
                group: self.group,
                shard_id: self.shard_id,
                timeout,
            }),
        }
    }

    /// Close the pool; safe to call more than once
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close().await;
        debug!(group = %self.group, shard_id = self.shard_id, "Closed database pool");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.pool.is_closed()
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// 1-based physical database index within the group
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn driver(&self) -> Driver {
        self.driver
    }

    pub fn group(&self) -> GroupKind {
        self.group
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
        }
    }
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Invalid DSN for {group} database {shard_id}: {reason}")]
    InvalidDsn {
        group: GroupKind,
        shard_id: u32,
        reason: String,
    },

    #[error("Ping failed for {group} database {shard_id}: {source}")]
    Ping {
        group: GroupKind,
        shard_id: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("Ping timed out after {timeout:?} for {group} database {shard_id}")]
    PingTimeout {
        group: GroupKind,
        shard_id: u32,
        timeout: Duration,
    },
}

impl Transient for ConnectionError {
    fn is_transient(&self) -> bool {
        match self {
            ConnectionError::InvalidDsn { .. } => false,
            ConnectionError::Ping { source, .. } => source.is_transient(),
            ConnectionError::PingTimeout { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_config(dir: &tempfile::TempDir, id: u32) -> DatabaseConfig {
        let path = dir.path().join(format!("db{id}.sqlite"));
        DatabaseConfig::sqlite(id, path.to_string_lossy().into_owned())
    }

    #[test]
    fn test_pool_settings_clamp_idle() {
        let mut config = DatabaseConfig::sqlite(1, "x.db");
        config.max_connections = 4;
        config.max_idle_connections = 10;
        let settings = PoolSettings::from(&config);
        assert_eq!(settings.max_open, 4);
        assert_eq!(settings.max_idle, 4);
        assert_eq!(settings.max_lifetime, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_open_ping_close() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(&sqlite_config(&dir, 3), GroupKind::Sharding)
            .await
            .unwrap();
        assert_eq!(conn.shard_id(), 3);
        assert_eq!(conn.group(), GroupKind::Sharding);
        assert_eq!(conn.driver(), Driver::Sqlite);
        conn.ping().await.unwrap();

        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        assert!(conn.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_open_rejects_empty_dsn() {
        let mut config = DatabaseConfig::sqlite(1, "");
        config.dsn = None;
        let err = Connection::open(&config, GroupKind::Master).await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidDsn { shard_id: 1, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_open_fails_when_ping_fails() {
        // read-only mode on a missing file cannot be opened
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sqlite");
        let config = DatabaseConfig::sqlite(2, format!("sqlite://{}?mode=ro", path.display()));
        let err = Connection::open(&config, GroupKind::Sharding)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Ping { shard_id: 2, .. }
                | ConnectionError::PingTimeout { shard_id: 2, .. }
        ));
    }
}
