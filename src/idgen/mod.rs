//! Entity identifiers
//!
//! UUIDv7 rendered as 32 lowercase hex characters. The leading bits are a
//! millisecond timestamp, so ids sort by creation time; the trailing random
//! bits are what the table selector routes on.

use uuid::Uuid;

use crate::sharding::ShardKey;

/// Length of a generated id
pub const ID_LEN: usize = 32;

/// New time-ordered id
pub fn generate_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// New id together with its shard key
pub fn generate_keyed_id() -> (String, ShardKey) {
    let uuid = Uuid::now_v7();
    (uuid.simple().to_string(), ShardKey::Uuid(uuid))
}
