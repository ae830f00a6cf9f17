//! Stable object identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, stable identity of a reflected object.
///
/// Assigned monotonically by the agent and never reused within a process
/// lifetime, so a destroyed object's id stays resolvable (as a tombstone)
/// forever.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Reserved invalid id; never assigned to an object.
    pub const INVALID: Self = Self(0);

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic allocator for [`ObjectId`]s.
#[derive(Debug)]
pub struct IdentityAllocator {
    next: u64,
}

impl IdentityAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self { next: 1 }
    }

    /// Hand out the next identity. Never returns the same id twice.
    pub fn allocate(&mut self) -> ObjectId {
        let id = ObjectId(self.next);
        self.next += 1;
        id
    }
}

impl Default for IdentityAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_valid() {
        let mut alloc = IdentityAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert!(a.is_valid());
        assert!(b > a);
        assert!(!ObjectId::INVALID.is_valid());
    }
}
