//! Horizontal sharding and multi-group database access
//!
//! Two groups of databases sit behind one [`group::GroupManager`]: a single
//! "master" database for non-sharded entities, and a "sharding" group holding
//! `total_tables` logical tables spread evenly over N physical databases.
//! Keys route to a table number, table numbers to a database, and
//! [`fanout::FanOut`] runs cross-shard reads concurrently on every database.

pub mod config;
pub mod fanout;
pub mod group;
pub mod health;
pub mod idgen;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod repository;
pub mod retry;
pub mod schema;
pub mod sharding;

#[cfg(test)]
mod test_support;
