use std::fmt;

use uuid::Uuid;

use super::SelectorError;

/// Shard key value - either a plain integer ID or a time-ordered UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardKey {
    Int(i64),
    Uuid(Uuid),
}

impl ShardKey {
    /// Parse a UUID key from its 32-char simple or hyphenated text form
    pub fn parse_uuid(s: &str) -> Result<Self, SelectorError> {
        Uuid::try_parse(s)
            .map(ShardKey::Uuid)
            .map_err(|e| SelectorError::InvalidKey(format!("{s:?}: {e}")))
    }

    /// Numeric value the table number is derived from
    ///
    /// Integers are used as-is. For UUIDs the last four bytes are read as a
    /// big-endian u32: in a UUIDv7 those bytes belong to the random `rand_b`
    /// field, so ids generated later do not pile onto one table.
    pub fn routing_value(&self) -> i64 {
        match self {
            ShardKey::Int(v) => *v,
            ShardKey::Uuid(u) => {
                let b = u.as_bytes();
                u32::from_be_bytes([b[12], b[13], b[14], b[15]]) as i64
            }
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::Int(v) => write!(f, "{v}"),
            ShardKey::Uuid(u) => write!(f, "{}", u.simple()),
        }
    }
}

impl From<i64> for ShardKey {
    fn from(v: i64) -> Self {
        ShardKey::Int(v)
    }
}

impl From<Uuid> for ShardKey {
    fn from(v: Uuid) -> Self {
        ShardKey::Uuid(v)
    }
}

impl TryFrom<&str> for ShardKey {
    type Error = SelectorError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        ShardKey::parse_uuid(s)
    }
}

impl TryFrom<&String> for ShardKey {
    type Error = SelectorError;

    fn try_from(s: &String) -> Result<Self, Self::Error> {
        ShardKey::parse_uuid(s)
    }
}
