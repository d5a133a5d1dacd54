//! Per-interface beacon state.

use std::sync::atomic::AtomicU64;
use std::sync::Mutex;

use bytes::Bytes;
use tbtt_core::{OpMode, Tsf, VifId};

use crate::queue::CabQueue;

/// A pooled beacon buffer. The pool hands one to each active interface;
/// `frame` is empty until the content provider has produced a beacon.
#[derive(Debug, Default)]
pub struct BeaconBuf {
    pub frame: Option<Bytes>,
}

impl BeaconBuf {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One virtual interface sharing the radio's beacon schedule.
///
/// Identity, role, slot and timestamp adjustment are fixed at activation;
/// only the buffer, the group queue and the last observed beacon timestamp
/// change afterwards.
#[derive(Debug)]
pub struct Vif {
    pub id: VifId,
    pub opmode: OpMode,
    /// Assigned beacon slot; `None` for self-linked ad hoc beacons.
    pub slot: Option<usize>,
    /// Timestamp adjustment for staggered non-zero slots, in microseconds.
    pub tsf_adjust: Tsf,
    /// Timestamp of the last beacon received for this interface.
    pub last_tstamp: AtomicU64,
    pub(crate) bcbuf: Mutex<Option<BeaconBuf>>,
    pub(crate) mcastq: Mutex<CabQueue>,
}

impl Vif {
    pub fn new(id: VifId, opmode: OpMode, slot: Option<usize>, tsf_adjust: Tsf) -> Self {
        Self {
            id,
            opmode,
            slot,
            tsf_adjust,
            last_tstamp: AtomicU64::new(0),
            bcbuf: Mutex::new(None),
            mcastq: Mutex::new(CabQueue::new()),
        }
    }
}
