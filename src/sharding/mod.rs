//! Table selection for the sharding group
//!
//! Every sharded entity is split into `total_tables` logical tables named
//! `{entity}_{NNN}`. Tables are laid out contiguously over the physical
//! databases, `tables_per_database` tables each.

mod key;
mod selector;

pub use key::ShardKey;
pub use selector::{
    physical_table_name, TableSelector, DEFAULT_TABLES_PER_DATABASE, DEFAULT_TOTAL_TABLES,
};

/// Table selection errors
#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("Invalid sharding topology: {0}")]
    InvalidTopology(String),

    #[error("Invalid shard key {0}")]
    InvalidKey(String),

    #[error("Invalid entity name {0:?} (expected lowercase snake_case)")]
    InvalidEntity(String),

    #[error("Table number {table_number} out of range (total tables: {total_tables})")]
    TableOutOfRange { table_number: i64, total_tables: u32 },
}
