//! # Identifiers
//!
//! Process membership tokens, pool ids and generation-checked handles.

use std::fmt;

/// Per-process membership token, valid only within its world.
///
/// Issued monotonically by the master and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct FusionId(u64);

impl FusionId {
    /// Not yet assigned (a process that is still joining).
    pub const UNASSIGNED: Self = Self(0);

    /// The master of every world.
    pub const MASTER: Self = Self(1);

    /// Creates an id from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns true for the master id.
    #[inline]
    #[must_use]
    pub const fn is_master(self) -> bool {
        self.0 == Self::MASTER.0
    }
}

impl fmt::Display for FusionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of an SHM pool, unique within its world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PoolId(pub u32);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// Generation-checked handle into a [`SlotTable`](crate::SlotTable).
///
/// The handle is split into two parts:
/// - Lower 32 bits: slot index
/// - Upper 32 bits: generation, advanced whenever the slot is freed
///
/// The generation is the type tag of the slot: a handle whose generation no
/// longer matches refers to something that was destroyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(u64);

impl Handle {
    /// Creates a handle from index and generation.
    #[inline]
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (index as u64))
    }

    /// Returns the index portion.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// Returns the generation portion.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Packs the handle into a wire value.
    #[inline]
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Unpacks a wire value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Null/invalid handle. Generation zero is never issued.
    pub const NULL: Self = Self(0);

    /// Checks if this handle is null.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.generation() == 0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index(), self.generation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_roundtrip() {
        let handle = Handle::new(12345, 67890);
        assert_eq!(handle.index(), 12345);
        assert_eq!(handle.generation(), 67890);
        assert_eq!(Handle::from_raw(handle.to_raw()), handle);
    }

    #[test]
    fn test_null_handle() {
        assert!(Handle::NULL.is_null());
        assert!(Handle::new(7, 0).is_null());
        assert!(!Handle::new(0, 1).is_null());
    }

    #[test]
    fn test_fusion_id_master() {
        assert!(FusionId::MASTER.is_master());
        assert!(!FusionId::new(2).is_master());
        assert_eq!(FusionId::new(5).to_string(), "#5");
    }
}
