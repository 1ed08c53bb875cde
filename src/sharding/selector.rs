use std::ops::Range;

use super::{ShardKey, SelectorError};

/// Default number of logical tables in the sharding group
pub const DEFAULT_TOTAL_TABLES: u32 = 32;
/// Default number of logical tables per physical database
pub const DEFAULT_TABLES_PER_DATABASE: u32 = 8;

/// Largest table count that still fits the three-digit suffix
const MAX_TOTAL_TABLES: u32 = 1000;

/// Format a physical table name (`{entity}_{NNN}`)
///
/// This is the only place table identifiers are built, so the entity name is
/// checked against a strict lowercase snake_case allow-list.
pub fn physical_table_name(entity: &str, table_number: u32) -> Result<String, SelectorError> {
    if !is_valid_entity(entity) {
        return Err(SelectorError::InvalidEntity(entity.to_string()));
    }
    if table_number >= MAX_TOTAL_TABLES {
        return Err(SelectorError::TableOutOfRange {
            table_number: table_number as i64,
            total_tables: MAX_TOTAL_TABLES,
        });
    }
    Ok(format!("{}_{:03}", entity, table_number))
}

fn is_valid_entity(entity: &str) -> bool {
    let mut chars = entity.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    entity.len() <= 60
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Maps shard keys to logical tables and logical tables to physical databases
///
/// Logical tables are laid out contiguously: database 1 owns tables
/// `0..tables_per_database`, database 2 the next block, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSelector {
    total_tables: u32,
    tables_per_database: u32,
}

impl Default for TableSelector {
    fn default() -> Self {
        Self {
            total_tables: DEFAULT_TOTAL_TABLES,
            tables_per_database: DEFAULT_TABLES_PER_DATABASE,
        }
    }
}

impl TableSelector {
    /// Create a selector, validating the topology
    pub fn new(total_tables: u32, tables_per_database: u32) -> Result<Self, SelectorError> {
        if tables_per_database == 0 {
            return Err(SelectorError::InvalidTopology(
                "tables_per_database must be greater than zero".into(),
            ));
        }
        if total_tables == 0 || total_tables > MAX_TOTAL_TABLES {
            return Err(SelectorError::InvalidTopology(format!(
                "total_tables must be in 1..={MAX_TOTAL_TABLES}, got {total_tables}"
            )));
        }
        if total_tables % tables_per_database != 0 {
            return Err(SelectorError::InvalidTopology(format!(
                "total_tables ({total_tables}) is not divisible by \
                 tables_per_database ({tables_per_database})"
            )));
        }
        Ok(Self {
            total_tables,
            tables_per_database,
        })
    }

    /// Logical table number for a key, always in `[0, total_tables)`
    pub fn table_number(&self, key: &ShardKey) -> u32 {
        key.routing_value().rem_euclid(self.total_tables as i64) as u32
    }

    /// Logical table number for a UUID given as text
    pub fn table_number_from_str(&self, key: &str) -> Result<u32, SelectorError> {
        Ok(self.table_number(&ShardKey::parse_uuid(key)?))
    }

    /// 1-based physical database index owning a logical table
    pub fn db_id(&self, table_number: u32) -> Result<u32, SelectorError> {
        if table_number >= self.total_tables {
            return Err(SelectorError::TableOutOfRange {
                table_number: table_number as i64,
                total_tables: self.total_tables,
            });
        }
        Ok(table_number / self.tables_per_database + 1)
    }

    /// Physical table name for an entity and key
    pub fn table_name(&self, entity: &str, key: &ShardKey) -> Result<String, SelectorError> {
        physical_table_name(entity, self.table_number(key))
    }

    pub fn table_count(&self) -> u32 {
        self.total_tables
    }

    pub fn tables_per_database(&self) -> u32 {
        self.tables_per_database
    }

    /// Number of physical databases implied by the topology
    pub fn database_count(&self) -> u32 {
        self.total_tables / self.tables_per_database
    }

    /// Logical tables resident on a physical database
    ///
    /// Returns an empty range for an unknown database index.
    pub fn tables_for_db(&self, db_id: u32) -> Range<u32> {
        if db_id == 0 || db_id > self.database_count() {
            return 0..0;
        }
        let start = (db_id - 1) * self.tables_per_database;
        start..start + self.tables_per_database
    }

    /// Check that a table name is one of the known physical tables
    pub fn validate_table_name(&self, table_name: &str, allowed_entities: &[&str]) -> bool {
        allowed_entities.iter().any(|entity| {
            table_name
                .strip_prefix(entity)
                .and_then(|rest| rest.strip_prefix('_'))
                .filter(|digits| digits.len() == 3 && digits.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|digits| digits.parse::<u32>().ok())
                .is_some_and(|n| n < self.total_tables)
        })
    }
}
