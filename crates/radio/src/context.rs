//! Per-radio beacon engine: interface lifecycle, timer arming and the
//! shared scheduling state the trigger dispatcher works against.
//!
//! Everything here runs from a blockable context and may race the
//! dispatcher in [`crate::dispatch`], so shared state sits behind
//! briefly-held locks and atomics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, warn};

use tbtt_core::types::{BSTUCK_THRESHOLD, DEFAULT_BEACON_INTERVAL, TU_MICROS};
use tbtt_core::{
    plan, tu_to_tsf, BeaconConfig, BeaconQueueParams, MissCounter, OpMode, SlotTable,
    SlotTimeSync, TimerPlan, Tsf, Tu, VifId,
};

use crate::dispatch::apply_tsf_adjust;
use crate::hal::{BeaconSource, IrqMask, RecoveryHandler, TimebaseHal, TxBeacon};
use crate::queue::{CabFrame, CabQueue};
use crate::vif::{BeaconBuf, Vif};
use crate::{lock, read, write, BeaconError};

/// Beacon scheduling state for one radio shared by up to `slots` virtual
/// interfaces.
pub struct BeaconEngine {
    pub(crate) hal: Arc<dyn TimebaseHal>,
    pub(crate) source: Arc<dyn BeaconSource>,
    pub(crate) recovery: Arc<dyn RecoveryHandler>,
    /// Radio operating mode, fixed at creation.
    pub(crate) opmode: OpMode,
    pub(crate) config: Mutex<BeaconConfig>,
    /// Base contention profile the per-mode queue parameters derive from.
    pub(crate) base_queue_params: BeaconQueueParams,
    pub(crate) slots: Mutex<SlotTable>,
    pub(crate) vifs: RwLock<HashMap<VifId, Arc<Vif>>>,
    /// Free beacon buffers; each active interface owns one until teardown.
    pub(crate) pool: Mutex<Vec<BeaconBuf>>,
    /// Shared post-beacon queue, fed from per-interface group queues at DTIM.
    pub(crate) cabq: Mutex<CabQueue>,
    /// The most recently armed timer plan.
    pub(crate) timing: Mutex<TimerPlan>,
    pub(crate) slot_time: SlotTimeSync,
    pub(crate) bmiss: MissCounter,
    pub(crate) dispatching: AtomicBool,
    pub(crate) beacons_active: AtomicBool,
    pub(crate) triggers: AtomicU64,
    pub(crate) beacons_sent: AtomicU64,
    pub(crate) cab_started: AtomicU64,
    pub(crate) cab_drained: AtomicU64,
}

impl BeaconEngine {
    pub fn new(
        hal: Arc<dyn TimebaseHal>,
        source: Arc<dyn BeaconSource>,
        recovery: Arc<dyn RecoveryHandler>,
        opmode: OpMode,
        config: BeaconConfig,
    ) -> Arc<Self> {
        let capacity = config.slots.max(1);
        let pool = (0..capacity).map(|_| BeaconBuf::new()).collect();
        log::info!(
            "beacon engine up: mode {:?}, {} slots, interval {} TU",
            opmode,
            capacity,
            config.beacon_interval
        );
        Arc::new(Self {
            hal,
            source,
            recovery,
            opmode,
            config: Mutex::new(config),
            base_queue_params: BeaconQueueParams::default(),
            slots: Mutex::new(SlotTable::new(capacity)),
            vifs: RwLock::new(HashMap::new()),
            pool: Mutex::new(pool),
            cabq: Mutex::new(CabQueue::new()),
            timing: Mutex::new(TimerPlan::disabled()),
            slot_time: SlotTimeSync::new(),
            bmiss: MissCounter::new(BSTUCK_THRESHOLD),
            dispatching: AtomicBool::new(false),
            beacons_active: AtomicBool::new(false),
            triggers: AtomicU64::new(0),
            beacons_sent: AtomicU64::new(0),
            cab_started: AtomicU64::new(0),
            cab_drained: AtomicU64::new(0),
        })
    }

    /// Brings `id` into the beacon schedule as `opmode`.
    ///
    /// AP and ad hoc interfaces get a transmit slot (ad hoc only when the
    /// hardware cannot self-link a beacon), a pooled buffer and an initial
    /// frame from the content source; station interfaces just register, they
    /// carry no beacon of their own. Re-activating an existing interface
    /// rebuilds its frame in place and keeps its slot.
    ///
    /// Returns the assigned slot; `None` when the interface is unslotted.
    pub fn activate_vif(&self, id: VifId, opmode: OpMode) -> Result<Option<usize>, BeaconError> {
        // bind before matching so the map guard is gone when vif locks are
        // taken below
        let existing = read(&self.vifs).get(&id).cloned();
        if let Some(vif) = existing {
            if vif.opmode != OpMode::Sta {
                self.rebuild_beacon(&vif)?;
            }
            return Ok(vif.slot);
        }
        if opmode == OpMode::Sta {
            let vif = Arc::new(Vif::new(id, opmode, None, 0));
            write(&self.vifs).insert(id, vif);
            return Ok(None);
        }

        let Some(buf) = lock(&self.pool).pop() else {
            return Err(BeaconError::CapacityExceeded);
        };

        let slotted = self.opmode == OpMode::Ap || !self.hal.has_self_linked_beacons();
        let slot = if slotted {
            match lock(&self.slots).allocate(id) {
                Some(slot) => Some(slot),
                None => {
                    lock(&self.pool).push(buf);
                    return Err(BeaconError::CapacityExceeded);
                }
            }
        } else {
            None
        };

        let (staggered, interval) = {
            let cfg = lock(&self.config);
            let interval = if cfg.beacon_interval == 0 {
                DEFAULT_BEACON_INTERVAL
            } else {
                cfg.beacon_interval
            };
            (cfg.staggered, interval)
        };
        let capacity = lock(&self.slots).capacity() as Tu;
        let tsf_adjust = match slot {
            // Slot 0 transmits at the unadjusted TBTT; later slots push
            // their timestamp forward to the interval boundary they miss.
            Some(s) if staggered && s > 0 => {
                let adjust_tu = interval * (capacity - s as Tu) / capacity;
                debug!(
                    "stagger beacons: slot {} interval {} adjust {} TU",
                    s, interval, adjust_tu
                );
                tu_to_tsf(adjust_tu)
            }
            _ => 0,
        };

        let vif = Arc::new(Vif::new(id, opmode, slot, tsf_adjust));
        *lock(&vif.bcbuf) = Some(buf);
        write(&self.vifs).insert(id, Arc::clone(&vif));

        // On failure the interface stays registered with an empty buffer;
        // the dispatcher skips it until a re-activation supplies a frame.
        self.rebuild_beacon(&vif)?;
        Ok(slot)
    }

    /// Takes `id` out of the schedule, completing any held frame and
    /// returning its buffer to the pool.
    pub fn remove_vif(&self, id: VifId) -> Result<(), BeaconError> {
        let Some(vif) = write(&self.vifs).remove(&id) else {
            return Err(BeaconError::UnknownInterface(id));
        };
        // The map lock is gone by now; vif locks are only ever taken after
        // it, on this path and in the dispatcher both.
        if let Some(mut buf) = lock(&vif.bcbuf).take() {
            if let Some(frame) = buf.frame.take() {
                self.source.release(id, frame);
            }
            lock(&self.pool).push(buf);
        }
        for frame in lock(&vif.mcastq).drain_all() {
            self.source.release(frame.vif, frame.payload);
        }
        if let Some(slot) = vif.slot {
            lock(&self.slots).release(slot);
        }
        debug!("interface {} left the beacon schedule", id);
        Ok(())
    }

    /// Releases the previous frame, if any, and installs a fresh one from
    /// the content source, stamped with the interface's TSF adjustment.
    fn rebuild_beacon(&self, vif: &Vif) -> Result<(), BeaconError> {
        let mut guard = lock(&vif.bcbuf);
        let Some(buf) = guard.as_mut() else {
            return Err(BeaconError::UnknownInterface(vif.id));
        };
        if let Some(old) = buf.frame.take() {
            self.source.release(vif.id, old);
        }
        let Some(frame) = self.source.create(vif.id) else {
            debug!("cannot get beacon for interface {}", vif.id);
            return Err(BeaconError::ContentUnavailable(vif.id));
        };
        buf.frame = Some(if vif.tsf_adjust != 0 {
            apply_tsf_adjust(&frame, vif.tsf_adjust)
        } else {
            frame
        });
        Ok(())
    }

    /// Computes and arms beacon and sleep timers.
    ///
    /// `changed` names the interface whose (re)configuration prompted this;
    /// its role and last observed beacon timestamp feed the plan. With
    /// `None` the radio's own mode is planned from scratch.
    pub fn configure_beacons(&self, changed: Option<VifId>) {
        let cfg = lock(&self.config).clone();
        let changed_vif = changed.and_then(|id| read(&self.vifs).get(&id).cloned());
        let (vif_mode, last_tstamp) = match &changed_vif {
            Some(vif) => (vif.opmode, vif.last_tstamp.load(Ordering::Relaxed)),
            None => (self.opmode, 0),
        };
        let self_linked = self.hal.has_self_linked_beacons();
        let now = self.hal.now_tsf();
        let timer_plan = plan(&cfg, self.opmode, vif_mode, last_tstamp, now, self_linked);
        let mask = IrqMask {
            swba: timer_plan.swba,
            bmiss: timer_plan.bmiss,
        };

        if timer_plan.sta.is_some() {
            if cfg.no_local_beacons {
                debug!("station timers computed, arming skipped (beacons suppressed)");
            } else {
                self.hal.set_interrupt_mask(IrqMask::default());
                self.hal.arm_beacon_timers(&timer_plan);
                self.hal.set_interrupt_mask(mask);
                self.beacons_active.store(true, Ordering::Relaxed);
            }
        } else if timer_plan.enabled {
            self.hal.set_interrupt_mask(IrqMask::default());
            let params = BeaconQueueParams::for_opmode(self.opmode, &self.base_queue_params);
            if !self.hal.configure_beacon_queue(&params) {
                error!("unable to update beacon queue parameters");
            }
            self.hal.arm_beacon_timers(&timer_plan);
            self.bmiss.clear();
            self.hal.set_interrupt_mask(mask);
            self.beacons_active.store(true, Ordering::Relaxed);
            if self.opmode == OpMode::Adhoc && self_linked {
                self.start_adhoc_beacons();
            }
        } else {
            debug!("beacon interval zero, timers left quiet");
            self.hal.set_interrupt_mask(IrqMask::default());
        }

        *lock(&self.timing) = timer_plan;
    }

    /// Loads the ad hoc beacon into hardware once; the self-linked
    /// descriptor keeps it going without per-interval triggers.
    fn start_adhoc_beacons(&self) {
        let Some(vif) = read(&self.vifs)
            .values()
            .find(|vif| vif.opmode == OpMode::Adhoc)
            .cloned()
        else {
            return;
        };
        let Some(frame) = lock(&vif.bcbuf).as_ref().and_then(|buf| buf.frame.clone()) else {
            debug!("adhoc start: no beacon buffer for interface {}", vif.id);
            return;
        };
        // Bring-up path; the beacon queue is known to be idle here.
        self.hal.begin_beacon_tx(vec![TxBeacon {
            vif: vif.id,
            slot: vif.slot,
            frame,
        }]);
    }

    /// Re-aligns the beacon timers to a beacon just received for `id`.
    pub fn resync(&self, id: VifId, tstamp: Tsf) -> Result<(), BeaconError> {
        let vif = read(&self.vifs)
            .get(&id)
            .cloned()
            .ok_or(BeaconError::UnknownInterface(id))?;
        vif.last_tstamp.store(tstamp, Ordering::Relaxed);
        self.configure_beacons(Some(id));
        self.beacons_active.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Replaces the beacon configuration and re-arms the timers.
    pub fn reconfigure(&self, config: BeaconConfig) {
        *lock(&self.config) = config;
        self.configure_beacons(None);
    }

    /// Buffers one group-addressed frame on `id`'s private queue until its
    /// next DTIM beacon. Returns the queue depth after the push.
    pub fn queue_cab(&self, id: VifId, payload: Bytes) -> Result<usize, BeaconError> {
        let vif = read(&self.vifs)
            .get(&id)
            .cloned()
            .ok_or(BeaconError::UnknownInterface(id))?;
        let mut mcastq = lock(&vif.mcastq);
        mcastq.push(CabFrame { vif: id, payload });
        Ok(mcastq.depth())
    }

    /// Completion hook for delivered CAB traffic: empties the shared queue
    /// and hands every frame back to the content source.
    pub fn cab_tx_completed(&self) -> usize {
        let done = lock(&self.cabq).drain_all();
        let completed = done.len();
        for frame in done {
            self.source.release(frame.vif, frame.payload);
        }
        completed
    }

    /// Requests an 11g slot-time change; the dispatcher commits it once
    /// every associated station has seen at least one more beacon.
    pub fn request_slot_time(&self, micros: u32) {
        debug!("slot time change to {} us requested", micros);
        self.slot_time.request(micros);
    }

    /// Quiesces the radio: interrupts off, queues stopped, every interface
    /// removed and all outstanding content completed.
    pub fn shutdown(&self) {
        self.hal.set_interrupt_mask(IrqMask::default());
        if !self.hal.stop_beacon_tx() {
            warn!("beacon queue did not stop on shutdown");
        }
        self.hal.stop_cab_tx();
        self.beacons_active.store(false, Ordering::Relaxed);
        for frame in lock(&self.cabq).drain_all() {
            self.source.release(frame.vif, frame.payload);
        }
        let ids: Vec<VifId> = read(&self.vifs).keys().copied().collect();
        for id in ids {
            self.remove_vif(id).ok();
        }
        *lock(&self.timing) = TimerPlan::disabled();
    }

    /// Wall-clock period between trigger events under the armed plan, if
    /// the plan wants any.
    pub fn trigger_period(&self) -> Option<Duration> {
        let timing = lock(&self.timing);
        if !timing.enabled || !timing.swba || timing.trigger_interval == 0 {
            return None;
        }
        Some(Duration::from_micros(
            timing.trigger_interval as u64 * TU_MICROS,
        ))
    }

    pub fn opmode(&self) -> OpMode {
        self.opmode
    }

    pub fn config(&self) -> BeaconConfig {
        lock(&self.config).clone()
    }

    pub fn timer_plan(&self) -> TimerPlan {
        lock(&self.timing).clone()
    }

    pub fn vif_count(&self) -> usize {
        read(&self.vifs).len()
    }

    pub fn slot_of(&self, id: VifId) -> Option<usize> {
        lock(&self.slots).slot_of(id)
    }

    pub fn miss_count(&self) -> u32 {
        self.bmiss.count()
    }

    pub fn beacons_active(&self) -> bool {
        self.beacons_active.load(Ordering::Relaxed)
    }

    /// (triggers seen, beacons handed to hardware, CAB bursts started,
    /// CAB frames force-drained)
    pub fn get_stats(&self) -> (u64, u64, u64, u64) {
        (
            self.triggers.load(Ordering::Relaxed),
            self.beacons_sent.load(Ordering::Relaxed),
            self.cab_started.load(Ordering::Relaxed),
            self.cab_drained.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{CountingRecovery, SimBeaconSource, SimulatedTimebase};

    fn engine(
        opmode: OpMode,
        config: BeaconConfig,
    ) -> (
        Arc<BeaconEngine>,
        Arc<SimulatedTimebase>,
        Arc<SimBeaconSource>,
    ) {
        let hal = Arc::new(SimulatedTimebase::new());
        let source = Arc::new(SimBeaconSource::new());
        let recovery = Arc::new(CountingRecovery::new());
        let engine = BeaconEngine::new(
            hal.clone(),
            source.clone(),
            recovery,
            opmode,
            config,
        );
        (engine, hal, source)
    }

    #[test]
    fn test_slots_fill_then_capacity_error() {
        let (engine, _, _) = engine(OpMode::Ap, BeaconConfig::default());
        for (id, want) in (1u64..=4).zip([0usize, 1, 2, 3]) {
            assert_eq!(engine.activate_vif(id, OpMode::Ap).unwrap(), Some(want));
        }
        assert!(matches!(
            engine.activate_vif(5, OpMode::Ap),
            Err(BeaconError::CapacityExceeded)
        ));
        assert_eq!(engine.vif_count(), 4);
    }

    #[test]
    fn test_reactivation_keeps_slot_and_releases_frame() {
        let (engine, _, source) = engine(OpMode::Ap, BeaconConfig::default());
        assert_eq!(engine.activate_vif(7, OpMode::Ap).unwrap(), Some(0));
        assert_eq!(engine.activate_vif(7, OpMode::Ap).unwrap(), Some(0));
        assert_eq!(engine.vif_count(), 1);
        // the first frame was completed back when the second replaced it
        assert_eq!(source.released().len(), 1);
    }

    #[test]
    fn test_remove_returns_slot_buffer_and_frame() {
        let (engine, _, source) = engine(OpMode::Ap, BeaconConfig::default());
        engine.activate_vif(1, OpMode::Ap).unwrap();
        engine.activate_vif(2, OpMode::Ap).unwrap();
        engine.remove_vif(1).unwrap();

        assert_eq!(engine.vif_count(), 1);
        assert_eq!(engine.slot_of(1), None);
        assert_eq!(source.released().len(), 1);
        // slot 0 is back but its successor is taken, so the spacing
        // heuristic sends the next interface to the open pair at 2
        assert_eq!(engine.activate_vif(3, OpMode::Ap).unwrap(), Some(2));
    }

    #[test]
    fn test_unknown_interface_is_an_error() {
        let (engine, _, _) = engine(OpMode::Ap, BeaconConfig::default());
        assert!(matches!(
            engine.remove_vif(9),
            Err(BeaconError::UnknownInterface(9))
        ));
        assert!(matches!(
            engine.resync(9, 0),
            Err(BeaconError::UnknownInterface(9))
        ));
        assert!(matches!(
            engine.queue_cab(9, Bytes::from_static(b"x")),
            Err(BeaconError::UnknownInterface(9))
        ));
    }

    #[test]
    fn test_activation_without_content_keeps_interface() {
        let (engine, _, source) = engine(OpMode::Ap, BeaconConfig::default());
        source.withhold(3);
        assert!(matches!(
            engine.activate_vif(3, OpMode::Ap),
            Err(BeaconError::ContentUnavailable(3))
        ));
        // slot and buffer stay claimed; a later re-activation fills them in
        assert_eq!(engine.vif_count(), 1);
        assert_eq!(engine.slot_of(3), Some(0));
        source.allow(3);
        assert_eq!(engine.activate_vif(3, OpMode::Ap).unwrap(), Some(0));
    }

    #[test]
    fn test_configure_arms_timers_and_queue() {
        let (engine, hal, _) = engine(OpMode::Ap, BeaconConfig::default());
        engine.activate_vif(1, OpMode::Ap).unwrap();
        engine.configure_beacons(Some(1));

        let plans = hal.armed_plans();
        assert_eq!(plans.len(), 1);
        assert!(plans[0].enabled);
        assert_eq!(plans[0].trigger_interval, 25);
        assert_eq!(
            hal.last_mask(),
            Some(IrqMask {
                swba: true,
                bmiss: false
            })
        );
        // AP beacons burst out ahead of everything else
        assert_eq!(
            hal.queue_params(),
            vec![BeaconQueueParams {
                aifs: 1,
                cwmin: 0,
                cwmax: 0
            }]
        );
        assert!(engine.beacons_active());
        assert_eq!(engine.trigger_period(), Some(Duration::from_micros(25_600)));
    }

    #[test]
    fn test_station_configure_arms_bmiss_only() {
        let (engine, hal, _) = engine(OpMode::Sta, BeaconConfig::default());
        engine.configure_beacons(None);

        assert_eq!(hal.armed_plans().len(), 1);
        assert_eq!(
            hal.last_mask(),
            Some(IrqMask {
                swba: false,
                bmiss: true
            })
        );
        // no beacon queue to configure when only listening
        assert!(hal.queue_params().is_empty());
        assert_eq!(engine.trigger_period(), None);
    }

    #[test]
    fn test_suppressed_station_timers_not_armed() {
        let config = BeaconConfig {
            no_local_beacons: true,
            ..BeaconConfig::default()
        };
        let (engine, hal, _) = engine(OpMode::Ap, config);
        engine.activate_vif(1, OpMode::Sta).unwrap();
        engine.configure_beacons(Some(1));

        assert!(hal.armed_plans().is_empty());
        assert!(!engine.beacons_active());
        assert!(engine.timer_plan().sta.is_some());
    }

    #[test]
    fn test_adhoc_self_linked_starts_one_beacon() {
        let (engine, hal, _) = {
            let hal = Arc::new(SimulatedTimebase::new());
            hal.set_self_linked(true);
            let source = Arc::new(SimBeaconSource::new());
            let recovery = Arc::new(CountingRecovery::new());
            let engine = BeaconEngine::new(
                hal.clone(),
                source,
                recovery,
                OpMode::Adhoc,
                BeaconConfig {
                    staggered: false,
                    ..BeaconConfig::default()
                },
            );
            (engine, hal, ())
        };
        assert_eq!(engine.activate_vif(1, OpMode::Adhoc).unwrap(), None);
        engine.configure_beacons(Some(1));

        let chains = hal.beacon_chains();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].len(), 1);
        assert_eq!(chains[0][0].vif, 1);
        assert_eq!(chains[0][0].slot, None);
        // hardware loops the descriptor, no trigger interrupt wanted
        assert_eq!(
            hal.last_mask(),
            Some(IrqMask {
                swba: false,
                bmiss: false
            })
        );
        assert_eq!(engine.trigger_period(), None);
        assert!(hal.armed_plans()[0].reset_tsf);
    }

    #[test]
    fn test_resync_stores_timestamp_and_rearms() {
        let (engine, hal, _) = engine(OpMode::Sta, BeaconConfig::default());
        engine.activate_vif(1, OpMode::Sta).unwrap();
        hal.set_tsf(tu_to_tsf(450));
        engine.resync(1, tu_to_tsf(380)).unwrap();

        let plans = hal.armed_plans();
        let sta = plans[0].sta.as_ref().unwrap();
        // rolled forward from the received timestamp past the clock
        assert_eq!(plans[0].next_tbtt, 500);
        assert_eq!(sta.dtim_period, 100);
        assert!(engine.beacons_active());
    }

    #[test]
    fn test_shutdown_returns_everything() {
        let (engine, hal, source) = engine(OpMode::Ap, BeaconConfig::default());
        engine.activate_vif(1, OpMode::Ap).unwrap();
        engine.activate_vif(2, OpMode::Ap).unwrap();
        engine.queue_cab(1, Bytes::from_static(b"cab")).unwrap();
        engine.configure_beacons(None);
        engine.shutdown();

        assert_eq!(engine.vif_count(), 0);
        assert!(!engine.beacons_active());
        assert_eq!(engine.trigger_period(), None);
        // both beacon frames and the queued CAB frame came back
        assert_eq!(source.released().len(), 3);
        assert_eq!(
            hal.last_mask(),
            Some(IrqMask {
                swba: false,
                bmiss: false
            })
        );
        assert_eq!(engine.activate_vif(3, OpMode::Ap).unwrap(), Some(0));
    }
}
