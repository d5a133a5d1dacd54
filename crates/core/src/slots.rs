//! Beacon transmit slot table.

use log::warn;

use crate::types::VifId;

/// Maps beacon transmit slots to the interface that owns them.
///
/// Allocation spaces interfaces out when it can: a slot whose successor is
/// also free is preferred, leaving the successor empty so a late beacon from
/// one interface is less likely to collide with the next interface's.
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<Option<VifId>>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn get(&self, slot: usize) -> Option<VifId> {
        self.slots.get(slot).copied().flatten()
    }

    pub fn slot_of(&self, vif: VifId) -> Option<usize> {
        self.slots.iter().position(|s| *s == Some(vif))
    }

    /// Assigns `vif` to the lowest free slot whose successor is also free,
    /// falling back to the lowest free slot, or `None` when the table is full.
    pub fn allocate(&mut self, vif: VifId) -> Option<usize> {
        debug_assert!(self.slot_of(vif).is_none(), "vif {} already slotted", vif);
        let capacity = self.slots.len();
        let mut fallback = None;
        for slot in 0..capacity {
            if self.slots[slot].is_some() {
                continue;
            }
            if slot + 1 < capacity && self.slots[slot + 1].is_none() {
                self.slots[slot] = Some(vif);
                return Some(slot);
            }
            if fallback.is_none() {
                fallback = Some(slot);
            }
        }
        let slot = fallback?;
        self.slots[slot] = Some(vif);
        Some(slot)
    }

    /// Frees `slot`, returning its occupant. Releasing an empty slot is an
    /// accounting bug in the caller.
    pub fn release(&mut self, slot: usize) -> Option<VifId> {
        if slot >= self.slots.len() {
            warn!("release of out-of-range beacon slot {}", slot);
            debug_assert!(false, "slot {} out of range", slot);
            return None;
        }
        let prev = self.slots[slot].take();
        if prev.is_none() {
            warn!("release of already-empty beacon slot {}", slot);
            debug_assert!(false, "slot {} was empty", slot);
        }
        prev
    }

    /// Occupied slots in ascending order.
    pub fn iter_occupied(&self) -> impl Iterator<Item = (usize, VifId)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, vif)| vif.map(|v| (slot, v)))
    }
}
