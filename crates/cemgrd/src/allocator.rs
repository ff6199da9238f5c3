//! Compact identifier allocation for VLAN tags and EVC short ids.
//!
//! The allocator scans circularly from a cursor, skipping a caller
//! supplied exclusion set, so ids are handed out in rising order and a
//! freed low id is reconsidered before the space wraps. The exclusion
//! set is derived from live state on every call; the allocator itself
//! only remembers ids that have been handed out but not yet committed
//! to that live state, so two allocations inside one critical section
//! can never return the same id.

use std::collections::BTreeSet;

/// Circular scanning id allocator over an inclusive range.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    min: u16,
    max: u16,
    cursor: u16,
    reserved: BTreeSet<u16>,
}

impl IdAllocator {
    /// Creates an allocator over `min..=max`.
    pub fn new(min: u16, max: u16) -> Self {
        assert!(min <= max, "empty id range");
        Self {
            min,
            max,
            cursor: min,
            reserved: BTreeSet::new(),
        }
    }

    /// Allocator for network-wide S-VLAN tags.
    pub fn vlan() -> Self {
        Self::new(crate::types::VlanId::MIN, crate::types::VlanId::MAX)
    }

    /// Allocator for EVC short ids.
    pub fn evc_short_id() -> Self {
        Self::new(1, 32767)
    }

    /// Returns the first id at or after the cursor that is neither in
    /// `in_use` nor reserved, wrapping once around the range. The
    /// returned id is reserved until [`commit`](Self::commit) or
    /// [`release`](Self::release); the cursor stays on it, so repeated
    /// calls hand out successive values.
    pub fn allocate(&mut self, in_use: &BTreeSet<u16>) -> Option<u16> {
        let span = (self.max - self.min) as u32 + 1;
        for off in 0..span {
            let candidate = self.min
                + ((self.cursor - self.min) as u32 + off).rem_euclid(span) as u16;
            if in_use.contains(&candidate) || self.reserved.contains(&candidate) {
                continue;
            }
            self.cursor = candidate;
            self.reserved.insert(candidate);
            return Some(candidate);
        }
        None
    }

    /// Drops the reservation of `id` once it is recorded in the live
    /// state the caller derives exclusion sets from.
    pub fn commit(&mut self, id: u16) {
        self.reserved.remove(&id);
    }

    /// Notes that `id` was released; drops any reservation and pulls the
    /// cursor back so the freed id is reused before higher values.
    pub fn release(&mut self, id: u16) {
        self.reserved.remove(&id);
        if (self.min..=self.max).contains(&id) && id < self.cursor {
            self.cursor = id;
        }
    }

    #[cfg(test)]
    fn cursor(&self) -> u16 {
        self.cursor
    }
}
