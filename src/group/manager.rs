//! Group manager implementation

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info};

use crate::config::{DatabaseConfig, DatabaseGroupsConfig};
use crate::fanout::ShardUnit;
use crate::metrics::metrics;
use crate::pool::{Connection, ConnectionError, GroupKind};
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::sharding::{physical_table_name, SelectorError, ShardKey, TableSelector};

/// Ordered set of connections forming one group
#[derive(Debug)]
pub struct Group {
    kind: GroupKind,
    /// Sorted by ascending shard id
    connections: Vec<Arc<Connection>>,
}

impl Group {
    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connection with the given 1-based shard id
    pub fn get(&self, shard_id: u32) -> Option<&Arc<Connection>> {
        // ids are exactly 1..=N after validation
        let conn = self.connections.get(shard_id.checked_sub(1)? as usize)?;
        (conn.shard_id() == shard_id).then_some(conn)
    }
}

/// Where a routed operation runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub table_number: u32,
    /// Physical table name (`{entity}_{NNN}`)
    pub table_name: String,
    pub shard_id: u32,
}

/// Result of pinging one connection
#[derive(Debug)]
pub struct PingOutcome {
    pub group: GroupKind,
    pub shard_id: u32,
    pub result: Result<(), ConnectionError>,
}

/// Owns the master and sharding groups and the table selector
///
/// Immutable once built; shared behind `Arc` by every repository. Routing
/// takes no locks.
#[derive(Debug)]
pub struct GroupManager {
    master: Group,
    sharding: Group,
    selector: TableSelector,
}

impl GroupManager {
    /// Validate the topology and open every configured database
    ///
    /// All-or-nothing: if any database fails to open, every connection that
    /// did open is closed before the error is returned.
    pub async fn connect(
        config: &DatabaseGroupsConfig,
        retry: &RetryPolicy,
    ) -> Result<Self, GroupError> {
        let selector = Self::validate(config)?;

        let mut sharding_configs: Vec<&DatabaseConfig> = config.sharding.databases.iter().collect();
        sharding_configs.sort_by_key(|db| db.id);

        let opens = config
            .master
            .iter()
            .map(|db| (GroupKind::Master, db))
            .chain(sharding_configs.into_iter().map(|db| (GroupKind::Sharding, db)))
            .map(|(kind, db)| async move {
                execute_with_retry(retry, || Connection::open(db, kind))
                    .await
                    .map(Arc::new)
                    .map_err(|e| e.into_inner())
            });

        let opened = Self::all_or_nothing(join_all(opens).await).await?;
        let (master, sharding): (Vec<_>, Vec<_>) = opened
            .into_iter()
            .partition(|conn| conn.group() == GroupKind::Master);

        info!(
            master = master.len(),
            sharding = sharding.len(),
            total_tables = selector.table_count(),
            tables_per_database = selector.tables_per_database(),
            "Database groups ready"
        );

        Ok(Self {
            master: Group {
                kind: GroupKind::Master,
                connections: master,
            },
            sharding: Group {
                kind: GroupKind::Sharding,
                connections: sharding,
            },
            selector,
        })
    }

    /// Keep every opened connection, or close them all if any open failed
    async fn all_or_nothing(
        results: Vec<Result<Arc<Connection>, ConnectionError>>,
    ) -> Result<Vec<Arc<Connection>>, GroupError> {
        let mut opened = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(conn) => opened.push(conn),
                Err(e) => {
                    error!(error = %e, "Failed to open database");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => Ok(opened),
            Some(e) => {
                info!(opened = opened.len(), "Closing databases opened before failure");
                join_all(opened.iter().map(|c| c.close())).await;
                Err(GroupError::Connection(e))
            }
        }
    }

    /// Check the configured topology against the selector
    fn validate(config: &DatabaseGroupsConfig) -> Result<TableSelector, GroupError> {
        match config.master.len() {
            0 => return Err(GroupError::MissingMaster),
            1 => {}
            n => {
                return Err(GroupError::Topology(format!(
                    "master group must have exactly one database, got {n}"
                )))
            }
        }

        let sharding = &config.sharding;
        let selector = TableSelector::new(sharding.total_tables, sharding.tables_per_database)?;
        let expected = selector.database_count();

        let mut ids: Vec<u32> = sharding.databases.iter().map(|db| db.id).collect();
        ids.sort_unstable();
        if ids.len() != expected as usize || !ids.iter().copied().eq(1..=expected) {
            return Err(GroupError::Topology(format!(
                "sharding group needs databases with ids 1..={expected} \
                 ({} tables / {} per database), got {:?}",
                selector.table_count(),
                selector.tables_per_database(),
                ids
            )));
        }

        for db in &sharding.databases {
            if let Some([min, max]) = db.table_range {
                let owned = selector.tables_for_db(db.id);
                if min != owned.start || max.checked_add(1) != Some(owned.end) {
                    return Err(GroupError::Topology(format!(
                        "database {} declares table_range [{min}, {max}] but owns [{}, {}]",
                        db.id,
                        owned.start,
                        owned.end.saturating_sub(1)
                    )));
                }
            }
        }

        for table in &sharding.tables {
            physical_table_name(&table.name, 0)?;
            if table.suffix_count != selector.table_count() {
                return Err(GroupError::Topology(format!(
                    "table {} has suffix_count {} but the group has {} tables",
                    table.name,
                    table.suffix_count,
                    selector.table_count()
                )));
            }
        }

        Ok(selector)
    }

    /// The single master connection
    pub fn master_connection(&self) -> Result<Arc<Connection>, GroupError> {
        self.master
            .connections
            .first()
            .cloned()
            .ok_or(GroupError::MissingMaster)
    }

    /// Sharding connection owning a logical table
    pub fn sharding_connection(&self, table_number: u32) -> Result<Arc<Connection>, GroupError> {
        let db_id = self.selector.db_id(table_number)?;
        self.sharding
            .get(db_id)
            .cloned()
            .ok_or(GroupError::Routing {
                table_number,
                db_id,
            })
    }

    /// Sharding connection responsible for a key
    pub fn sharding_connection_by_key(
        &self,
        key: &ShardKey,
    ) -> Result<Arc<Connection>, GroupError> {
        self.sharding_connection(self.selector.table_number(key))
    }

    /// Resolve table number, physical table and connection for a key
    pub fn route(
        &self,
        entity: &str,
        key: &ShardKey,
    ) -> Result<(Route, Arc<Connection>), GroupError> {
        let table_number = self.selector.table_number(key);
        let table_name = physical_table_name(entity, table_number)?;
        let conn = self.sharding_connection(table_number)?;

        debug!(
            entity = entity,
            key = %key,
            table = %table_name,
            shard_id = conn.shard_id(),
            "Routed key"
        );
        metrics().record_route(GroupKind::Sharding.as_str(), conn.shard_id());

        Ok((
            Route {
                table_number,
                table_name,
                shard_id: conn.shard_id(),
            },
            conn,
        ))
    }

    /// Every sharding connection, ascending by shard id
    pub fn all_sharding_connections(&self) -> &[Arc<Connection>] {
        self.sharding.connections()
    }

    /// One fan-out unit per sharding connection with its resident tables
    pub fn shard_units(&self) -> Vec<ShardUnit> {
        self.sharding
            .connections
            .iter()
            .map(|conn| ShardUnit {
                connection: conn.clone(),
                table_numbers: self.selector.tables_for_db(conn.shard_id()).collect(),
            })
            .collect()
    }

    pub fn master(&self) -> &Group {
        &self.master
    }

    pub fn sharding(&self) -> &Group {
        &self.sharding
    }

    /// Connections of both groups, master first
    pub fn connections(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.master
            .connections
            .iter()
            .chain(self.sharding.connections.iter())
    }

    pub fn table_selector(&self) -> &TableSelector {
        &self.selector
    }

    /// Ping every connection concurrently
    pub async fn ping_all(&self) -> Vec<PingOutcome> {
        join_all(self.connections().map(|conn| async move {
            PingOutcome {
                group: conn.group(),
                shard_id: conn.shard_id(),
                result: conn.ping().await,
            }
        }))
        .await
    }

    /// Close every connection; idempotent
    pub async fn close_all(&self) {
        join_all(self.connections().map(|conn| conn.close())).await;
        info!("Database groups closed");
    }
}

/// Group construction and routing errors
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("Master group has no database")]
    MissingMaster,

    #[error("Invalid group topology: {0}")]
    Topology(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("No sharding connection for table {table_number} (database {db_id})")]
    Routing { table_number: u32, db_id: u32 },

    #[error(transparent)]
    Selector(#[from] SelectorError),
}
