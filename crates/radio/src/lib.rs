//! Multi-BSS beacon scheduling and timing engine.
//!
//! Owns the beacon schedule for every virtual interface sharing a radio:
//! slot assignment, timer planning against the hardware timebase, per-trigger
//! frame dispatch, group-addressed (CAB) traffic gating at DTIM, stuck-beacon
//! recovery and two-phase slot-time changes. Hardware access goes through the
//! seams in [`hal`]; a simulated timebase for tests and demos lives in
//! [`simulated`].

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

pub mod context;
pub mod dispatch;
pub mod hal;
pub mod queue;
pub mod runner;
pub mod simulated;
pub mod vif;

pub use context::BeaconEngine;
pub use dispatch::TriggerOutcome;
pub use hal::{BeaconSource, ContentUpdate, IrqMask, RecoveryHandler, TimebaseHal, TxBeacon};
pub use queue::{CabFrame, CabQueue};
pub use runner::TriggerLoop;
pub use simulated::{CountingRecovery, SimBeaconSource, SimulatedTimebase};
pub use tbtt_core::{BeaconConfig, BeaconQueueParams, OpMode, TimerPlan};

/// Locks `mutex`, carrying on with the inner state if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("no free beacon slot or buffer")]
    CapacityExceeded,

    #[error("content provider has no beacon for interface {0}")]
    ContentUnavailable(u64),

    #[error("interface {0} is not active")]
    UnknownInterface(u64),
}
