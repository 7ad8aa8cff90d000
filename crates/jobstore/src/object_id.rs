//! Object identifiers
//!
//! 12 bytes rendered as 24 lowercase hex chars:
//! 4-byte big-endian seconds, 5 process-random bytes, 3-byte counter.
//! Ids minted by one process sort in creation order.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DbError;

const COUNTER_MASK: u32 = 0x00ff_ffff;

fn process_bytes() -> &'static [u8; 5] {
    static BYTES: OnceLock<[u8; 5]> = OnceLock::new();
    BYTES.get_or_init(|| {
        let random = uuid::Uuid::new_v4();
        let mut out = [0u8; 5];
        out.copy_from_slice(&random.as_bytes()[..5]);
        out
    })
}

fn counter() -> &'static AtomicU32 {
    static COUNTER: OnceLock<AtomicU32> = OnceLock::new();
    // Start in the lower half so a process cannot wrap within one second
    COUNTER.get_or_init(|| {
        let seed = uuid::Uuid::new_v4().as_u128() as u32;
        AtomicU32::new(seed & 0x003f_ffff)
    })
}

/// Store-generated unique document identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Mint a new id.
    pub fn new() -> Self {
        let secs = Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        let count = counter().fetch_add(1, Ordering::SeqCst) & COUNTER_MASK;

        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(process_bytes());
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        ObjectId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        ObjectId(bytes)
    }

    /// Parse a 24-char hex string (either case).
    pub fn parse_str(s: &str) -> Result<Self, DbError> {
        if s.len() != 24 {
            return Err(DbError::InvalidId(s.to_string()));
        }
        let decoded = hex::decode(s).map_err(|_| DbError::InvalidId(s.to_string()))?;
        let mut bytes = [0u8; 12];
        bytes.copy_from_slice(&decoded);
        Ok(ObjectId(bytes))
    }

    pub fn is_valid(s: &str) -> bool {
        Self::parse_str(s).is_ok()
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Creation time, second precision.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let mut secs = [0u8; 4];
        secs.copy_from_slice(&self.0[..4]);
        Utc.timestamp_opt(u32::from_be_bytes(secs) as i64, 0)
            .single()
            .unwrap_or_default()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ObjectId {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_str(s)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ObjectId::parse_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = ObjectId::new();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 24);
        assert_eq!(ObjectId::parse_str(&hex).unwrap(), id);
    }

    #[test]
    fn rejects_malformed_strings() {
        for bad in ["", "not-an-id", "123", "zzzzzzzzzzzzzzzzzzzzzzzz", "0123456789abcdef012345678"] {
            let err = ObjectId::parse_str(bad).unwrap_err();
            assert!(matches!(err, DbError::InvalidId(ref s) if s == bad));
        }
    }

    #[test]
    fn accepts_uppercase_and_normalizes() {
        let id = ObjectId::parse_str("5F1B2C3D4E5F6A7B8C9D0E1F").unwrap();
        assert_eq!(id.to_hex(), "5f1b2c3d4e5f6a7b8c9d0e1f");
    }

    #[test]
    fn ids_sort_in_creation_order() {
        let ids: Vec<ObjectId> = (0..1000).map(|_| ObjectId::new()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn timestamp_is_close_to_now() {
        let id = ObjectId::new();
        let drift = (Utc::now() - id.timestamp()).num_seconds();
        assert!((0..=2).contains(&drift));
    }
}
