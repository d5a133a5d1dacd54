//! Hardware seams consumed by the beacon engine.
//!
//! Register programming, descriptor encoding and frame construction stay on
//! the far side of these traits. All methods are synchronous; the dispatcher
//! calls them from trigger context and none may block.

use bytes::Bytes;
use tbtt_core::{BeaconQueueParams, TimerPlan, Tsf, VifId};

use crate::queue::CabFrame;

/// Interrupt sources the engine arms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqMask {
    /// Software beacon alert: the per-interval trigger.
    pub swba: bool,
    /// Beacon miss, for station operation.
    pub bmiss: bool,
}

/// One beacon ready for transmission this trigger.
#[derive(Debug, Clone)]
pub struct TxBeacon {
    pub vif: VifId,
    pub slot: Option<usize>,
    pub frame: Bytes,
}

/// Refreshed beacon content for one interface.
#[derive(Debug, Clone)]
pub struct ContentUpdate {
    pub frame: Bytes,
    /// The frame changed size and its device mapping must be rebuilt.
    pub size_changed: bool,
    /// This beacon carries a DTIM and releases buffered group traffic.
    pub dtim: bool,
}

/// Beacon timer and transmit-queue access on the hardware timebase.
pub trait TimebaseHal: Send + Sync {
    /// Current hardware timebase in microseconds.
    fn now_tsf(&self) -> Tsf;

    /// Programs the beacon timers (and station sleep timers) from `plan`.
    fn arm_beacon_timers(&self, plan: &TimerPlan);

    fn set_interrupt_mask(&self, mask: IrqMask);

    /// Applies contention parameters to the beacon queue. Returns false when
    /// the hardware rejects them.
    fn configure_beacon_queue(&self, params: &BeaconQueueParams) -> bool;

    /// Hands over an ordered beacon chain and starts the beacon queue.
    /// Lower slots come first; the adapter owns any hardware chain encoding.
    fn begin_beacon_tx(&self, chain: Vec<TxBeacon>);

    /// Stops the beacon queue. Returns false when the queue did not stop in
    /// time; the hardware is still expected to force it down.
    fn stop_beacon_tx(&self) -> bool;

    /// Whether the previous beacon chain is still in the queue.
    fn tx_pending(&self) -> bool;

    /// Starts the CAB queue on `frames`. The hardware gates this queue to
    /// begin only after the next beacon.
    fn begin_cab_tx(&self, frames: &[CabFrame]);

    fn stop_cab_tx(&self) -> bool;

    /// Commits a slot-time change, in microseconds.
    fn set_slot_time(&self, micros: u32);

    /// Whether the hardware can self-link an ad hoc beacon descriptor and
    /// transmit without per-interval triggers.
    fn has_self_linked_beacons(&self) -> bool {
        false
    }
}

/// Supplies and reclaims beacon frame content. Frame layout, information
/// elements and rates are this collaborator's business.
pub trait BeaconSource: Send + Sync {
    /// Builds the initial beacon for a newly activated interface.
    fn create(&self, vif: VifId) -> Option<Bytes>;

    /// Refreshes dynamic beacon content. `group_depth` is the interface's
    /// pending group-addressed traffic, for TIM sizing.
    fn refresh(&self, vif: VifId, group_depth: usize) -> Option<ContentUpdate>;

    /// Re-establishes the device mapping after the frame changed size.
    fn remap(&self, vif: VifId, frame: &Bytes);

    /// Completes a frame the engine no longer holds: a torn-down beacon or
    /// drained CAB traffic.
    fn release(&self, vif: VifId, frame: Bytes);
}

/// Last-resort escalation when the beacon queue is stuck.
pub trait RecoveryHandler: Send + Sync {
    fn reset_radio(&self);
}
