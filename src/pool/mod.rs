//! Physical database connections
//!
//! One `Connection` per configured database, each owning a `sqlx` pool.

mod connection;

pub use connection::{
    Connection, ConnectionError, GroupKind, PoolSettings, PoolStats, PING_TIMEOUT,
};
