//! Two-phase slot-time change synchronized to the beacon clock.
//!
//! When a non-ERP station joins or leaves an 11g network the slot time must
//! change, but associated stations need at least one full beacon interval to
//! observe the announcement first. A request is therefore held for one
//! rotation of the beacon schedule: the dispatcher records the slot at which
//! it first sees the request and commits when that slot comes around again.
//! Burst schedules have no meaningful slot, record a match-anything marker
//! and commit on the following cycle.

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

const IDLE: u8 = 0;
const REQUESTED: u8 = 1;
const COMMITTING: u8 = 2;

/// Matches any slot; recorded for burst schedules.
const SLOT_ANY: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTimeState {
    Idle,
    Requested,
    Committing,
}

/// Lock-free state machine for pending slot-time changes.
///
/// `request` may be called from any context; `observe` only from the
/// dispatcher, once per trigger.
#[derive(Debug)]
pub struct SlotTimeSync {
    state: AtomicU8,
    pending_micros: AtomicU32,
    commit_slot: AtomicUsize,
}

impl Default for SlotTimeSync {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotTimeSync {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            pending_micros: AtomicU32::new(0),
            commit_slot: AtomicUsize::new(SLOT_ANY),
        }
    }

    /// Requests a slot-time change to `micros`. A request issued while a
    /// previous one is still committing restarts the protocol.
    pub fn request(&self, micros: u32) {
        self.pending_micros.store(micros, Ordering::Relaxed);
        self.state.store(REQUESTED, Ordering::Release);
    }

    /// Advances the protocol for one trigger cycle. `slot` is the slot the
    /// dispatcher computed this cycle, or `None` on a burst schedule.
    /// Returns the slot time to push to hardware when the change commits.
    pub fn observe(&self, slot: Option<usize>) -> Option<u32> {
        match self.state.load(Ordering::Acquire) {
            REQUESTED => {
                self.commit_slot
                    .store(slot.unwrap_or(SLOT_ANY), Ordering::Relaxed);
                self.state.store(COMMITTING, Ordering::Release);
                None
            }
            COMMITTING => {
                let recorded = self.commit_slot.load(Ordering::Relaxed);
                if recorded == SLOT_ANY || slot == Some(recorded) {
                    self.state.store(IDLE, Ordering::Release);
                    Some(self.pending_micros.load(Ordering::Relaxed))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn state(&self) -> SlotTimeState {
        match self.state.load(Ordering::Acquire) {
            REQUESTED => SlotTimeState::Requested,
            COMMITTING => SlotTimeState::Committing,
            _ => SlotTimeState::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_waits_for_recorded_slot() {
        let sync = SlotTimeSync::new();
        sync.request(20);
        assert_eq!(sync.state(), SlotTimeState::Requested);

        // first cycle after the request records slot 2
        assert_eq!(sync.observe(Some(2)), None);
        assert_eq!(sync.state(), SlotTimeState::Committing);

        // not slot 3, not slot 0, not slot 1
        assert_eq!(sync.observe(Some(3)), None);
        assert_eq!(sync.observe(Some(0)), None);
        assert_eq!(sync.observe(Some(1)), None);

        // slot 2 again: one full rotation has passed
        assert_eq!(sync.observe(Some(2)), Some(20));
        assert_eq!(sync.state(), SlotTimeState::Idle);
        assert_eq!(sync.observe(Some(2)), None);
    }

    #[test]
    fn test_burst_commits_next_cycle() {
        let sync = SlotTimeSync::new();
        sync.request(9);
        assert_eq!(sync.observe(None), None);
        assert_eq!(sync.observe(None), Some(9));
    }

    #[test]
    fn test_new_request_restarts_protocol() {
        let sync = SlotTimeSync::new();
        sync.request(20);
        assert_eq!(sync.observe(Some(1)), None);
        // overridden mid-commit; the slot is re-recorded on the next cycle
        sync.request(9);
        assert_eq!(sync.observe(Some(2)), None);
        assert_eq!(sync.observe(Some(1)), None);
        assert_eq!(sync.observe(Some(2)), Some(9));
    }

    #[test]
    fn test_idle_observe_is_noop() {
        let sync = SlotTimeSync::new();
        assert_eq!(sync.observe(Some(0)), None);
        assert_eq!(sync.observe(None), None);
        assert_eq!(sync.state(), SlotTimeState::Idle);
    }
}
