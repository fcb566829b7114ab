//! Process-unique identifiers.
//!
//! [`Uid`] is a cheap monotonic counter value used for anything that only has
//! to be unique within a single run (layers, windows, subscriptions).
//! [`Guid`] is a random RFC-4122 v4 identifier for things that may leave the
//! process.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static NEXT_UID: AtomicU64 = AtomicU64::new(0);

/// Returns a value strictly greater than every value previously returned in
/// this process.
pub fn next_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

/// Generates a random v4 GUID.
pub fn generate_guid() -> Guid {
    Guid::new()
}

/// Monotonic 64-bit identifier.
///
/// `Uid::default()` issues a fresh id, which keeps the "every default
/// construction is unique" property of the id space. Use [`Uid::INVALID`] for
/// an unset value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(pub u64);

impl Uid {
    /// Sentinel for "no id".
    pub const INVALID: Uid = Uid(u64::MAX);

    /// Issues the next id from the process-wide counter.
    pub fn new() -> Self {
        Self(next_uid())
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for Uid {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for Uid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

/// Random 128-bit identifier, serialized as the canonical hyphenated string.
///
/// The nil GUID (`00000000-0000-0000-0000-000000000000`) means "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Guid(pub Uuid);

impl Guid {
    /// The nil GUID.
    pub const INVALID: Guid = Guid(Uuid::nil());

    /// Creates a new random v4 GUID.
    ///
    /// The version nibble and the RFC-4122 variant bits are set by `uuid`;
    /// the randomness comes from the operating system's CSPRNG.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_nil()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for Guid {
    fn default() -> Self {
        Self::INVALID
    }
}

impl FromStr for Guid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_next_uid_is_strictly_increasing() {
        let a = next_uid();
        let b = next_uid();
        let c = next_uid();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_default_uid_is_fresh() {
        let first = Uid::default();
        let second = Uid::default();
        assert!(first.is_valid());
        assert!(second > first);
        assert!(!Uid::INVALID.is_valid());
        assert_eq!(Uid::INVALID.value(), u64::MAX);
        assert_eq!(Uid::INVALID.to_string(), "invalid");
    }

    #[test]
    fn test_uids_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| (0..1000).map(|_| next_uid()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for uid in handle.join().unwrap() {
                assert!(seen.insert(uid), "uid {} issued twice", uid);
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_guid_format_and_version() {
        let guid = generate_guid();
        let text = guid.to_string();

        assert_eq!(text.len(), 36);
        assert_eq!(&text[8..9], "-");
        assert_eq!(&text[14..15], "4");

        let bytes = guid.as_bytes();
        assert_eq!(bytes[6] >> 4, 0b0100);
        assert_eq!(bytes[8] >> 6, 0b10);
        assert!(guid.is_valid());
    }

    #[test]
    fn test_guid_parse_and_invalid() {
        let parsed: Guid = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
        assert_eq!(parsed.to_string(), "550e8400-e29b-41d4-a716-446655440000");

        let nil: Guid = "00000000-0000-0000-0000-000000000000".parse().unwrap();
        assert_eq!(nil, Guid::INVALID);
        assert!(!nil.is_valid());
        assert_eq!(Guid::default(), Guid::INVALID);

        assert!("not-a-guid".parse::<Guid>().is_err());
    }

    #[test]
    fn test_guid_serde_uses_hyphenated_string() {
        let guid: Guid = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
        let json = serde_json::to_string(&guid).unwrap();
        assert_eq!(json, "\"550e8400-e29b-41d4-a716-446655440000\"");
    }
}
