//! # Slot Table
//!
//! Generation-checked storage for calls, reactors and pooled objects.
//!
//! Freed slots are recycled through a free list, and every free advances the
//! slot's generation so handles issued before the free stop resolving.

use crate::id::Handle;

/// One slot of the table.
#[derive(Debug)]
struct Slot<T> {
    /// Current generation. Odd history does not matter, zero is never used.
    generation: u32,
    /// The stored value, `None` while free.
    value: Option<T>,
}

/// Growable table of values addressed by generation-checked [`Handle`]s.
///
/// # Thread Safety
///
/// This table is NOT thread-safe. Wrap it in a lock when shared.
///
/// # Example
///
/// ```rust
/// use fusion_core::SlotTable;
///
/// let mut table = SlotTable::new();
/// let handle = table.insert("surface");
/// assert_eq!(table.get(handle), Some(&"surface"));
///
/// table.remove(handle);
/// assert!(table.get(handle).is_none()); // stale handle
/// ```
#[derive(Debug)]
pub struct SlotTable<T> {
    /// The storage array.
    slots: Vec<Slot<T>>,
    /// Free list - indices of available slots.
    free_list: Vec<u32>,
    /// Number of occupied slots.
    len: usize,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotTable<T> {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            len: 0,
        }
    }

    /// Returns the number of occupied slots.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no slot is occupied.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores a value and returns its handle.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` slots are requested.
    pub fn insert(&mut self, value: T) -> Handle {
        self.len += 1;

        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }

        let index = u32::try_from(self.slots.len()).expect("slot table exhausted");
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        Handle::new(index, 1)
    }

    /// Gets a reference to a live value.
    #[inline]
    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.value.as_ref()
    }

    /// Gets a mutable reference to a live value.
    #[inline]
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.value.as_mut()
    }

    /// Returns true if the handle still resolves.
    #[inline]
    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Removes a value, invalidating its handle.
    ///
    /// Returns `None` if the handle was already stale.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let value = slot.value.take()?;

        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        self.free_list.push(handle.index());
        self.len -= 1;

        Some(value)
    }

    /// Iterates over all live values.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|v| (Handle::new(index as u32, slot.generation), v))
        })
    }

    /// Returns the handles of every value matching the predicate.
    pub fn handles_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<Handle> {
        self.iter()
            .filter(|(_, value)| predicate(value))
            .map(|(handle, _)| handle)
            .collect()
    }
}
