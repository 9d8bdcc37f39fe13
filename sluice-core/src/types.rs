//! Strongly-typed identifiers for Sluice entities.
//!
//! A request's identity is its `RequestId`, not its address: blockers track
//! running and waiting requests by id so that admission and release can happen
//! on different stack frames (or threads) without sharing references.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (a `RequestId` is not interchangeable with a raw counter)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(RequestId, "req", "Process-unique identifier for one inbound request.");

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl RequestId {
    /// Mints a fresh id, unique for the lifetime of the process.
    #[must_use]
    pub fn next_unique() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A key grouping requests that share a concurrency or rate scope.
///
/// Cloning is a reference-count bump; the per-controller key maps hold the
/// canonical copy, so every request with the same logical identity resolves to
/// the same state entry.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey(Arc<str>);

impl PartitionKey {
    /// Creates a key from any string-like value.
    #[must_use]
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(Arc::from(value.as_ref()))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key({})", self.0)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PartitionKey {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl std::borrow::Borrow<str> for PartitionKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        let id = RequestId::new(42);
        assert_eq!(format!("{id}"), "req-42");
        assert_eq!(format!("{id:?}"), "req(42)");
    }

    #[test]
    fn test_next_unique_is_monotonic() {
        let a = RequestId::next_unique();
        let b = RequestId::next_unique();
        assert!(b > a);
    }

    #[test]
    fn test_partition_key_equality() {
        let a = PartitionKey::new("10.0.0.1");
        let b = PartitionKey::from(String::from("10.0.0.1"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "10.0.0.1");
        assert_eq!(format!("{a:?}"), "key(10.0.0.1)");
    }

    #[test]
    fn test_partition_key_borrow_lookup() {
        let mut map = std::collections::HashMap::new();
        map.insert(PartitionKey::new("alice"), 1);
        assert_eq!(map.get("alice"), Some(&1));
    }
}
