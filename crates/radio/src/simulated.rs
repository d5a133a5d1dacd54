//! Simulated hardware for tests and demos.
//!
//! [`SimulatedTimebase`] stands in for the radio's clock and beacon queues,
//! recording every call the engine makes; [`SimBeaconSource`] produces
//! deterministic beacon-shaped frames on a configurable DTIM cadence. Both
//! are driven manually from test code, so unit tests stay exact, but the
//! timebase can also anchor to the wall clock (with optional airtime jitter)
//! for demo runs under the trigger loop.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace};
use rand_distr::{Distribution, Normal};

use tbtt_core::types::{DEFAULT_BEACON_INTERVAL, TIMESTAMP_LEN};
use tbtt_core::{BeaconQueueParams, TimerPlan, Tsf, VifId};

use crate::hal::{BeaconSource, ContentUpdate, IrqMask, RecoveryHandler, TimebaseHal, TxBeacon};
use crate::lock;
use crate::queue::CabFrame;

#[derive(Debug, Clone, Copy)]
enum Clock {
    /// Advanced only by `set_tsf`/`advance`.
    Manual(Tsf),
    /// Runs with the wall clock from the recorded instant.
    Anchored(Instant),
}

/// Recording stand-in for the hardware timebase and transmit queues.
#[derive(Debug)]
pub struct SimulatedTimebase {
    clock: Mutex<Clock>,
    jitter: Mutex<Option<Normal<f64>>>,
    self_linked: AtomicBool,
    tx_pending: AtomicBool,
    fail_stop: AtomicBool,
    stop_beacon_calls: AtomicU64,
    stop_cab_calls: AtomicU64,
    plans: Mutex<Vec<TimerPlan>>,
    masks: Mutex<Vec<IrqMask>>,
    queue_params: Mutex<Vec<BeaconQueueParams>>,
    chains: Mutex<Vec<Vec<TxBeacon>>>,
    cab_bursts: Mutex<Vec<Vec<CabFrame>>>,
    slot_times: Mutex<Vec<u32>>,
}

impl SimulatedTimebase {
    /// A timebase with a manual clock starting at zero.
    pub fn new() -> Self {
        Self::with_clock(Clock::Manual(0))
    }

    /// A timebase whose clock runs with the wall clock, for driving the
    /// engine under the async trigger loop.
    pub fn anchored() -> Self {
        Self::with_clock(Clock::Anchored(Instant::now()))
    }

    fn with_clock(clock: Clock) -> Self {
        Self {
            clock: Mutex::new(clock),
            jitter: Mutex::new(None),
            self_linked: AtomicBool::new(false),
            tx_pending: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            stop_beacon_calls: AtomicU64::new(0),
            stop_cab_calls: AtomicU64::new(0),
            plans: Mutex::new(Vec::new()),
            masks: Mutex::new(Vec::new()),
            queue_params: Mutex::new(Vec::new()),
            chains: Mutex::new(Vec::new()),
            cab_bursts: Mutex::new(Vec::new()),
            slot_times: Mutex::new(Vec::new()),
        }
    }

    pub fn set_tsf(&self, tsf: Tsf) {
        *lock(&self.clock) = Clock::Manual(tsf);
    }

    /// Moves the clock forward by `micros`.
    pub fn advance(&self, micros: u64) {
        let mut clock = lock(&self.clock);
        *clock = match *clock {
            Clock::Manual(tsf) => Clock::Manual(tsf.wrapping_add(micros)),
            // shifting the anchor back makes the elapsed reading jump ahead
            Clock::Anchored(t0) => {
                Clock::Anchored(t0.checked_sub(Duration::from_micros(micros)).unwrap_or(t0))
            }
        };
    }

    /// Skews every clock reading by a zero-mean gaussian with the given
    /// standard deviation in microseconds, imitating interrupt latency and
    /// airtime contention.
    pub fn set_airtime_jitter(&self, std_dev_micros: f64) {
        *lock(&self.jitter) = Normal::new(0.0, std_dev_micros).ok();
    }

    pub fn set_self_linked(&self, enabled: bool) {
        self.self_linked.store(enabled, Ordering::Relaxed);
    }

    /// Marks the previous beacon chain as still sitting in the queue, as a
    /// stuck transmitter would.
    pub fn set_tx_pending(&self, pending: bool) {
        self.tx_pending.store(pending, Ordering::Relaxed);
    }

    /// Makes `stop_beacon_tx` report failure.
    pub fn fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::Relaxed);
    }

    /// Every timer plan armed so far, oldest first.
    pub fn armed_plans(&self) -> Vec<TimerPlan> {
        lock(&self.plans).clone()
    }

    pub fn last_mask(&self) -> Option<IrqMask> {
        lock(&self.masks).last().copied()
    }

    pub fn queue_params(&self) -> Vec<BeaconQueueParams> {
        lock(&self.queue_params).clone()
    }

    /// Every beacon chain handed to `begin_beacon_tx`, oldest first.
    pub fn beacon_chains(&self) -> Vec<Vec<TxBeacon>> {
        lock(&self.chains).clone()
    }

    pub fn cab_bursts(&self) -> Vec<Vec<CabFrame>> {
        lock(&self.cab_bursts).clone()
    }

    pub fn stop_beacon_calls(&self) -> u64 {
        self.stop_beacon_calls.load(Ordering::Relaxed)
    }

    pub fn stop_cab_calls(&self) -> u64 {
        self.stop_cab_calls.load(Ordering::Relaxed)
    }

    pub fn slot_times(&self) -> Vec<u32> {
        lock(&self.slot_times).clone()
    }
}

impl Default for SimulatedTimebase {
    fn default() -> Self {
        Self::new()
    }
}

impl TimebaseHal for SimulatedTimebase {
    fn now_tsf(&self) -> Tsf {
        let micros = match *lock(&self.clock) {
            Clock::Manual(tsf) => tsf,
            Clock::Anchored(t0) => t0.elapsed().as_micros() as u64,
        };
        match *lock(&self.jitter) {
            Some(normal) => {
                let skew = normal.sample(&mut rand::rng());
                (micros as f64 + skew).max(0.0) as u64
            }
            None => micros,
        }
    }

    fn arm_beacon_timers(&self, plan: &TimerPlan) {
        if plan.reset_tsf {
            let mut clock = lock(&self.clock);
            *clock = match *clock {
                Clock::Manual(_) => Clock::Manual(0),
                Clock::Anchored(_) => Clock::Anchored(Instant::now()),
            };
            debug!("sim timebase reset");
        }
        trace!(
            "sim: timers armed, next tbtt {} every {} TU",
            plan.next_tbtt,
            plan.trigger_interval
        );
        lock(&self.plans).push(plan.clone());
    }

    fn set_interrupt_mask(&self, mask: IrqMask) {
        lock(&self.masks).push(mask);
    }

    fn configure_beacon_queue(&self, params: &BeaconQueueParams) -> bool {
        lock(&self.queue_params).push(*params);
        true
    }

    fn begin_beacon_tx(&self, chain: Vec<TxBeacon>) {
        trace!("sim: beacon chain of {} loaded", chain.len());
        lock(&self.chains).push(chain);
    }

    fn stop_beacon_tx(&self) -> bool {
        self.stop_beacon_calls.fetch_add(1, Ordering::Relaxed);
        !self.fail_stop.load(Ordering::Relaxed)
    }

    fn tx_pending(&self) -> bool {
        self.tx_pending.load(Ordering::Relaxed)
    }

    fn begin_cab_tx(&self, frames: &[CabFrame]) {
        trace!("sim: cab burst of {} started", frames.len());
        lock(&self.cab_bursts).push(frames.to_vec());
    }

    fn stop_cab_tx(&self) -> bool {
        self.stop_cab_calls.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn set_slot_time(&self, micros: u32) {
        lock(&self.slot_times).push(micros);
    }

    fn has_self_linked_beacons(&self) -> bool {
        self.self_linked.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct SourceState {
    withheld: HashSet<VifId>,
    refreshes: HashMap<VifId, u64>,
    extra_len: HashMap<VifId, usize>,
    pending_resize: HashSet<VifId>,
    released: Vec<(VifId, Bytes)>,
    remaps: Vec<(VifId, usize)>,
}

/// Beacon content source producing deterministic frames: a 24-byte
/// management header, a zeroed timestamp field for the engine to patch, and
/// a TIM-shaped tail that reflects the group-queue depth hint.
#[derive(Debug)]
pub struct SimBeaconSource {
    /// Every `n`th refresh per interface is a DTIM.
    dtim_period: AtomicU32,
    state: Mutex<SourceState>,
}

impl SimBeaconSource {
    pub fn new() -> Self {
        Self {
            dtim_period: AtomicU32::new(1),
            state: Mutex::new(SourceState::default()),
        }
    }

    pub fn set_dtim_period(&self, period: u32) {
        self.dtim_period.store(period.max(1), Ordering::Relaxed);
    }

    /// Makes `create` and `refresh` return nothing for `vif`.
    pub fn withhold(&self, vif: VifId) {
        lock(&self.state).withheld.insert(vif);
    }

    pub fn allow(&self, vif: VifId) {
        lock(&self.state).withheld.remove(&vif);
    }

    /// Grows `vif`'s next frame, so the refresh after this reports a size
    /// change and the engine has to remap.
    pub fn grow_frame(&self, vif: VifId) {
        let mut state = lock(&self.state);
        *state.extra_len.entry(vif).or_insert(0) += 16;
        state.pending_resize.insert(vif);
    }

    /// Frames completed back to the source, in completion order.
    pub fn released(&self) -> Vec<(VifId, Bytes)> {
        lock(&self.state).released.clone()
    }

    /// `(vif, frame length)` for every remap request.
    pub fn remaps(&self) -> Vec<(VifId, usize)> {
        lock(&self.state).remaps.clone()
    }

    fn build_frame(vif: VifId, group_depth: usize, extra: usize, until_dtim: u32) -> Bytes {
        let mut frame = BytesMut::with_capacity(48 + extra);
        // management header: beacon to the broadcast address from a locally
        // administered BSSID derived from the interface id
        frame.put_u8(0x80);
        frame.put_u8(0x00);
        frame.put_u16_le(0); // duration
        frame.put_slice(&[0xff; 6]);
        let id = vif.to_be_bytes();
        let bssid = [0x02, 0x00, id[4], id[5], id[6], id[7]];
        frame.put_slice(&bssid);
        frame.put_slice(&bssid);
        frame.put_u16_le(0); // sequence
        // timestamp, left zero; staggered interfaces get theirs patched
        frame.put_bytes(0, TIMESTAMP_LEN);
        frame.put_u16_le(DEFAULT_BEACON_INTERVAL as u16);
        frame.put_u16_le(0x0401); // ESS, short slot time
        // TIM element sized by the pending group traffic hint
        frame.put_u8(5);
        frame.put_u8(4 + extra as u8);
        frame.put_u8(until_dtim.min(0xff) as u8);
        frame.put_u8(0);
        frame.put_u8(0);
        frame.put_u8(group_depth.min(0xff) as u8);
        frame.put_bytes(0, extra);
        frame.freeze()
    }
}

impl Default for SimBeaconSource {
    fn default() -> Self {
        Self::new()
    }
}

impl BeaconSource for SimBeaconSource {
    fn create(&self, vif: VifId) -> Option<Bytes> {
        let state = lock(&self.state);
        if state.withheld.contains(&vif) {
            return None;
        }
        let extra = state.extra_len.get(&vif).copied().unwrap_or(0);
        Some(Self::build_frame(vif, 0, extra, 0))
    }

    fn refresh(&self, vif: VifId, group_depth: usize) -> Option<ContentUpdate> {
        let period = self.dtim_period.load(Ordering::Relaxed);
        let mut state = lock(&self.state);
        if state.withheld.contains(&vif) {
            return None;
        }
        let n = state.refreshes.entry(vif).or_insert(0);
        let phase = (*n % period as u64) as u32;
        let dtim = phase == 0;
        *n += 1;
        let size_changed = state.pending_resize.remove(&vif);
        let extra = state.extra_len.get(&vif).copied().unwrap_or(0);
        let until_dtim = if dtim { 0 } else { period - phase };
        Some(ContentUpdate {
            frame: Self::build_frame(vif, group_depth, extra, until_dtim),
            size_changed,
            dtim,
        })
    }

    fn remap(&self, vif: VifId, frame: &Bytes) {
        lock(&self.state).remaps.push((vif, frame.len()));
    }

    fn release(&self, vif: VifId, frame: Bytes) {
        lock(&self.state).released.push((vif, frame));
    }
}

/// Recovery hook that just counts radio resets.
#[derive(Debug, Default)]
pub struct CountingRecovery {
    resets: AtomicU64,
}

impl CountingRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }
}

impl RecoveryHandler for CountingRecovery {
    fn reset_radio(&self) {
        debug!("sim: radio reset requested");
        self.resets.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbtt_core::types::MGMT_HEADER_LEN;

    #[test]
    fn test_manual_clock_resets_with_plan() {
        let hal = SimulatedTimebase::new();
        hal.set_tsf(5_000);
        hal.advance(200);
        assert_eq!(hal.now_tsf(), 5_200);

        let plan = TimerPlan {
            reset_tsf: true,
            ..TimerPlan::disabled()
        };
        hal.arm_beacon_timers(&plan);
        assert_eq!(hal.now_tsf(), 0);
        assert_eq!(hal.armed_plans().len(), 1);
    }

    #[test]
    fn test_frame_shape_leaves_timestamp_zero() {
        let source = SimBeaconSource::new();
        let frame = source.create(3).unwrap();
        assert!(frame.len() > MGMT_HEADER_LEN + TIMESTAMP_LEN);
        assert_eq!(frame[0], 0x80);
        assert_eq!(
            &frame[MGMT_HEADER_LEN..MGMT_HEADER_LEN + TIMESTAMP_LEN],
            [0u8; TIMESTAMP_LEN].as_slice()
        );
    }

    #[test]
    fn test_dtim_cadence_per_interface() {
        let source = SimBeaconSource::new();
        source.set_dtim_period(3);
        let dtims: Vec<bool> = (0..4)
            .map(|_| source.refresh(1, 0).unwrap().dtim)
            .collect();
        assert_eq!(dtims, vec![true, false, false, true]);
        // cadence is tracked per interface
        assert!(source.refresh(2, 0).unwrap().dtim);
    }

    #[test]
    fn test_grow_frame_reports_size_change_once() {
        let source = SimBeaconSource::new();
        let before = source.refresh(1, 0).unwrap();
        source.grow_frame(1);
        let grown = source.refresh(1, 0).unwrap();
        assert!(grown.size_changed);
        assert_eq!(grown.frame.len(), before.frame.len() + 16);
        assert!(!source.refresh(1, 0).unwrap().size_changed);
    }

    #[test]
    fn test_withheld_interface_has_no_content() {
        let source = SimBeaconSource::new();
        source.withhold(7);
        assert!(source.create(7).is_none());
        assert!(source.refresh(7, 0).is_none());
        source.allow(7);
        assert!(source.create(7).is_some());
    }
}
