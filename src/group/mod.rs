//! Database groups
//!
//! Two groups: "master" holds the single database for non-sharded entities,
//! "sharding" holds the N databases the logical tables are spread over.

mod manager;

pub use manager::{Group, GroupError, GroupManager, PingOutcome, Route};
