//! Trigger-context beacon dispatch.
//!
//! Runs once per software beacon alert, synchronously and to completion:
//! picks the interfaces due this interval, refreshes their frames, gates
//! group-addressed traffic on DTIM and hands the hardware an ordered chain.
//! Misses are counted here and escalate to recovery when the queue looks
//! stuck.

use std::sync::atomic::Ordering;

use bytes::{Bytes, BytesMut};
use log::{debug, error, trace, warn};

use tbtt_core::types::{DEFAULT_BEACON_INTERVAL, MGMT_HEADER_LEN, TIMESTAMP_LEN};
use tbtt_core::{tsf_to_tu, BeaconConfig, MissOutcome, Tsf, VifId};

use crate::context::BeaconEngine;
use crate::hal::TxBeacon;
use crate::queue::CabFrame;
use crate::{lock, read};

/// What one trigger event amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A dispatch was already running; this trigger was dropped.
    Skipped,
    /// The previous chain is still in the queue; nothing was issued.
    Missed { consecutive: u32, stuck: bool },
    /// No interface had a beacon due this interval.
    Idle,
    /// A chain of `beacons` frames was handed to the hardware.
    Transmitted { beacons: u32 },
}

/// Writes `adjust` microseconds into the frame's timestamp field, right
/// after the management header.
pub(crate) fn apply_tsf_adjust(frame: &Bytes, adjust: Tsf) -> Bytes {
    if frame.len() < MGMT_HEADER_LEN + TIMESTAMP_LEN {
        warn!(
            "beacon frame too short for a timestamp field ({} bytes)",
            frame.len()
        );
        return frame.clone();
    }
    let mut patched = BytesMut::from(frame.as_ref());
    patched[MGMT_HEADER_LEN..MGMT_HEADER_LEN + TIMESTAMP_LEN]
        .copy_from_slice(&adjust.to_le_bytes());
    patched.freeze()
}

impl BeaconEngine {
    /// Trigger entry point. Serialized against itself by an atomic guard;
    /// an overlapping trigger is dropped rather than run concurrently.
    pub fn on_trigger(&self) -> TriggerOutcome {
        if self.dispatching.swap(true, Ordering::Acquire) {
            warn!("trigger overlapped a running dispatch");
            return TriggerOutcome::Skipped;
        }
        let outcome = self.dispatch();
        self.dispatching.store(false, Ordering::Release);
        outcome
    }

    fn dispatch(&self) -> TriggerOutcome {
        self.triggers.fetch_add(1, Ordering::Relaxed);
        if !lock(&self.timing).enabled {
            return TriggerOutcome::Idle;
        }
        let cfg = lock(&self.config).clone();

        // The previous beacon must have left the queue. If it has not,
        // skip this period; too many consecutive misses mean the queue is
        // stuck and the radio needs a reset.
        if self.hal.tx_pending() {
            return match self.bmiss.record() {
                MissOutcome::BelowThreshold(n) => {
                    debug!("missed {} consecutive beacons", n);
                    TriggerOutcome::Missed {
                        consecutive: n,
                        stuck: false,
                    }
                }
                MissOutcome::ThresholdCrossed(n) => {
                    error!("beacon is officially stuck, resetting (miss count {})", n);
                    self.recovery.reset_radio();
                    TriggerOutcome::Missed {
                        consecutive: n,
                        stuck: true,
                    }
                }
                MissOutcome::AboveThreshold(n) => {
                    error!("beacon still stuck after reset ({} misses)", n);
                    TriggerOutcome::Missed {
                        consecutive: n,
                        stuck: false,
                    }
                }
            };
        }
        if let Some(misses) = self.bmiss.clear() {
            debug!("resume beacon xmit after {} misses", misses);
        }

        let nvifs = read(&self.vifs).len();
        let capacity = lock(&self.slots).capacity();
        let mut chain: Vec<TxBeacon> = Vec::new();
        let slot_for_commit = if cfg.staggered {
            // Compute the due slot from the timebase instead of trusting
            // trigger cadence, so a late trigger still serves the right
            // interface.
            let interval = if cfg.beacon_interval == 0 {
                DEFAULT_BEACON_INTERVAL
            } else {
                cfg.beacon_interval
            };
            let tsf = self.hal.now_tsf();
            let tsftu = tsf_to_tu(tsf);
            let slot =
                (((tsftu % interval) as u64 * capacity as u64) / interval as u64) as usize;
            let scheduled = lock(&self.slots).get((slot + 1) % capacity);
            debug!(
                "slot {} [tsf {} tsftu {} interval {}] interface {:?}",
                slot, tsf, tsftu, interval, scheduled
            );
            if let Some(id) = scheduled {
                if let Some(beacon) = self.generate_beacon(id, &cfg, nvifs) {
                    chain.push(beacon);
                }
            }
            Some(slot)
        } else {
            let occupied: Vec<(usize, VifId)> = lock(&self.slots).iter_occupied().collect();
            for (_, id) in occupied {
                if let Some(beacon) = self.generate_beacon(id, &cfg, nvifs) {
                    chain.push(beacon);
                }
            }
            None
        };

        // An 11g slot-time change commits only once the requesting slot
        // comes around again, so every station saw at least one beacon
        // carrying the new parameters. Burst mode matches any slot.
        if let Some(micros) = self.slot_time.observe(slot_for_commit) {
            log::info!("committing slot time {} us", micros);
            self.hal.set_slot_time(micros);
        }

        if chain.is_empty() {
            return TriggerOutcome::Idle;
        }
        if !self.hal.stop_beacon_tx() {
            // the adapter still forces the queue down, so proceed
            error!("beacon queue did not stop?");
        }
        let beacons = chain.len() as u32;
        self.hal.begin_beacon_tx(chain);
        self.beacons_sent.fetch_add(beacons as u64, Ordering::Relaxed);
        TriggerOutcome::Transmitted { beacons }
    }

    /// Refreshes `id`'s beacon and, on a DTIM, moves its group-addressed
    /// backlog onto the shared CAB queue and starts the CAB burst.
    ///
    /// Returns the ready-to-transmit beacon, or `None` when the interface
    /// has nothing to send this interval.
    fn generate_beacon(&self, id: VifId, cfg: &BeaconConfig, nvifs: usize) -> Option<TxBeacon> {
        let vif = read(&self.vifs).get(&id).cloned()?;
        let mut buf_guard = lock(&vif.bcbuf);
        let Some(buf) = buf_guard.as_mut() else {
            debug!("interface {} has no beacon buffer", id);
            return None;
        };
        if buf.frame.is_none() {
            debug!("interface {} has no beacon frame yet", id);
            return None;
        }

        // Group queue stays locked across the refresh and the merge below
        // so the TIM the frame advertises matches what the merge moves.
        let mut mcastq = lock(&vif.mcastq);
        let mcastq_depth = mcastq.depth();

        let Some(update) = self.source.refresh(id, mcastq_depth) else {
            debug!("no beacon content for interface {}", id);
            return None;
        };
        if update.size_changed {
            self.source.remap(id, &update.frame);
            trace!(
                "interface {} beacon resized to {} bytes",
                id,
                update.frame.len()
            );
        }
        let frame = if vif.tsf_adjust != 0 {
            apply_tsf_adjust(&update.frame, vif.tsf_adjust)
        } else {
            update.frame
        };
        buf.frame = Some(frame.clone());

        // If CAB traffic from a previous DTIM is still pending and this
        // beacon is also a DTIM: with a single interface let it finish on
        // its own; with several interfaces staggered, drain it so this
        // interface's traffic can be scheduled in its place.
        let cabq_depth = lock(&self.cabq).depth();
        if mcastq_depth > 0 && update.dtim && cabq_depth > 0 && nvifs > 1 && cfg.staggered {
            if !self.hal.stop_cab_tx() {
                debug!("cab queue did not stop");
            }
            let stale = lock(&self.cabq).drain_all();
            self.cab_drained
                .fetch_add(stale.len() as u64, Ordering::Relaxed);
            for old in stale {
                self.source.release(old.vif, old.payload);
            }
            debug!("flush previous cabq traffic");
        }

        if update.dtim {
            let mut cabq = lock(&self.cabq);
            if mcastq.depth() > 0 {
                cabq.splice_from(&mut mcastq);
            }
            // the CAB queue is gated by the beacon, so starting it ahead
            // of the beacon chain is safe
            if cabq.depth() > 0 {
                let burst: Vec<CabFrame> = cabq.iter().cloned().collect();
                self.hal.begin_cab_tx(&burst);
                self.cab_started.fetch_add(1, Ordering::Relaxed);
            }
        }

        Some(TxBeacon {
            vif: id,
            slot: vif.slot,
            frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tbtt_core::{tu_to_tsf, OpMode};

    use crate::simulated::{CountingRecovery, SimBeaconSource, SimulatedTimebase};

    fn ap_engine(
        staggered: bool,
        vifs: u64,
    ) -> (
        Arc<BeaconEngine>,
        Arc<SimulatedTimebase>,
        Arc<SimBeaconSource>,
        Arc<CountingRecovery>,
    ) {
        let hal = Arc::new(SimulatedTimebase::new());
        let source = Arc::new(SimBeaconSource::new());
        let recovery = Arc::new(CountingRecovery::new());
        let config = tbtt_core::BeaconConfig {
            staggered,
            ..Default::default()
        };
        let engine = BeaconEngine::new(
            hal.clone(),
            source.clone(),
            recovery.clone(),
            OpMode::Ap,
            config,
        );
        for id in 1..=vifs {
            engine.activate_vif(id, OpMode::Ap).unwrap();
        }
        engine.configure_beacons(None);
        (engine, hal, source, recovery)
    }

    #[test]
    fn test_staggered_trigger_serves_slot_after_current() {
        let (engine, hal, _, _) = ap_engine(true, 2);

        // 410 TU into the schedule: sub-slot 0, so slot 1 is due next
        hal.set_tsf(tu_to_tsf(410));
        assert_eq!(
            engine.on_trigger(),
            TriggerOutcome::Transmitted { beacons: 1 }
        );
        let chains = hal.beacon_chains();
        let chain = chains.last().unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].vif, 2);
        assert_eq!(chain[0].slot, Some(1));

        // sub-slot 1 points at slot 2, which is unoccupied
        hal.set_tsf(tu_to_tsf(435));
        assert_eq!(engine.on_trigger(), TriggerOutcome::Idle);
        assert_eq!(hal.beacon_chains().len(), 1);
    }

    #[test]
    fn test_burst_chains_every_interface_in_slot_order() {
        let (engine, hal, _, _) = ap_engine(false, 3);
        assert_eq!(
            engine.on_trigger(),
            TriggerOutcome::Transmitted { beacons: 3 }
        );
        let chains = hal.beacon_chains();
        let slots: Vec<_> = chains.last().unwrap().iter().map(|b| b.slot).collect();
        assert_eq!(slots, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn test_misses_escalate_once_at_threshold() {
        let (engine, hal, _, recovery) = ap_engine(true, 1);
        hal.set_tx_pending(true);

        for n in 1..9 {
            assert_eq!(
                engine.on_trigger(),
                TriggerOutcome::Missed {
                    consecutive: n,
                    stuck: false
                }
            );
        }
        assert_eq!(recovery.resets(), 0);
        assert_eq!(
            engine.on_trigger(),
            TriggerOutcome::Missed {
                consecutive: 9,
                stuck: true
            }
        );
        assert_eq!(recovery.resets(), 1);
        // past the threshold the reset is not re-fired
        assert_eq!(
            engine.on_trigger(),
            TriggerOutcome::Missed {
                consecutive: 10,
                stuck: false
            }
        );
        assert_eq!(recovery.resets(), 1);

        // one clean drain ends the run
        hal.set_tx_pending(false);
        hal.set_tsf(tu_to_tsf(375));
        assert_eq!(
            engine.on_trigger(),
            TriggerOutcome::Transmitted { beacons: 1 }
        );
        assert_eq!(engine.miss_count(), 0);
    }

    #[test]
    fn test_interface_without_content_is_skipped() {
        let (engine, hal, source, _) = ap_engine(false, 2);
        source.withhold(1);
        assert_eq!(
            engine.on_trigger(),
            TriggerOutcome::Transmitted { beacons: 1 }
        );
        let chains = hal.beacon_chains();
        assert_eq!(chains.last().unwrap()[0].vif, 2);
    }

    #[test]
    fn test_tsf_adjust_patched_for_late_slots_only() {
        let (engine, hal, _, _) = ap_engine(true, 2);

        hal.set_tsf(tu_to_tsf(410)); // serves slot 1
        engine.on_trigger();
        let chains = hal.beacon_chains();
        let frame = &chains.last().unwrap()[0].frame;
        // slot 1 of 4 at interval 100: 75 TU ahead, microseconds on the wire
        assert_eq!(&frame[24..32], 76_800u64.to_le_bytes().as_slice());

        hal.set_tsf(tu_to_tsf(475)); // serves slot 0
        engine.on_trigger();
        let chains = hal.beacon_chains();
        let frame = &chains.last().unwrap()[0].frame;
        assert_eq!(chains.last().unwrap()[0].vif, 1);
        assert_eq!(&frame[24..32], [0u8; 8].as_slice());
    }

    #[test]
    fn test_stop_failure_still_transmits() {
        let (engine, hal, _, _) = ap_engine(true, 1);
        hal.fail_stop(true);
        hal.set_tsf(tu_to_tsf(375));
        assert_eq!(
            engine.on_trigger(),
            TriggerOutcome::Transmitted { beacons: 1 }
        );
        assert_eq!(hal.beacon_chains().len(), 1);
    }

    #[test]
    fn test_dtim_merges_group_queue_and_starts_cab() {
        let (engine, hal, _, _) = ap_engine(true, 1);
        engine.queue_cab(1, Bytes::from_static(b"m1")).unwrap();
        engine.queue_cab(1, Bytes::from_static(b"m2")).unwrap();

        hal.set_tsf(tu_to_tsf(375));
        engine.on_trigger();
        let bursts = hal.cab_bursts();
        assert_eq!(bursts.len(), 1);
        assert_eq!(bursts[0].len(), 2);
        let (_, _, cab_started, cab_drained) = engine.get_stats();
        assert_eq!(cab_started, 1);
        assert_eq!(cab_drained, 0);

        // single interface: stale backlog rides along instead of being
        // flushed
        engine.queue_cab(1, Bytes::from_static(b"m3")).unwrap();
        hal.set_tsf(tu_to_tsf(475));
        engine.on_trigger();
        assert_eq!(hal.cab_bursts().last().unwrap().len(), 3);
        assert_eq!(engine.get_stats().3, 0);
        assert_eq!(engine.cab_tx_completed(), 3);
    }

    #[test]
    fn test_staggered_multi_bss_flushes_stale_cab() {
        let (engine, hal, source, _) = ap_engine(true, 2);
        engine.queue_cab(1, Bytes::from_static(b"stale")).unwrap();
        hal.set_tsf(tu_to_tsf(375)); // serves interface 1
        engine.on_trigger();
        assert_eq!(hal.cab_bursts().last().unwrap().len(), 1);

        engine.queue_cab(2, Bytes::from_static(b"fresh")).unwrap();
        hal.set_tsf(tu_to_tsf(410)); // serves interface 2
        engine.on_trigger();

        // interface 1's undrained burst was failed back before the merge
        assert_eq!(engine.get_stats().3, 1);
        let released = source.released();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].1, Bytes::from_static(b"stale"));
        assert_eq!(hal.stop_cab_calls(), 1);
        let bursts = hal.cab_bursts();
        assert_eq!(bursts.last().unwrap().len(), 1);
        assert_eq!(bursts.last().unwrap()[0].vif, 2);
    }

    #[test]
    fn test_slot_time_commits_when_slot_recurs() {
        let (engine, hal, _, _) = ap_engine(true, 2);
        engine.request_slot_time(9);

        hal.set_tsf(tu_to_tsf(410)); // sub-slot 0: recorded
        engine.on_trigger();
        assert!(hal.slot_times().is_empty());

        hal.set_tsf(tu_to_tsf(435)); // sub-slot 1: not ours
        engine.on_trigger();
        assert!(hal.slot_times().is_empty());

        hal.set_tsf(tu_to_tsf(510)); // sub-slot 0 again: commit
        engine.on_trigger();
        assert_eq!(hal.slot_times(), vec![9]);
    }

    #[test]
    fn test_burst_slot_time_commits_next_cycle() {
        let (engine, hal, _, _) = ap_engine(false, 1);
        engine.request_slot_time(20);
        engine.on_trigger();
        assert!(hal.slot_times().is_empty());
        engine.on_trigger();
        assert_eq!(hal.slot_times(), vec![20]);
    }

    #[test]
    fn test_overlapping_trigger_is_skipped() {
        let (engine, hal, _, _) = ap_engine(true, 1);
        engine.dispatching.store(true, Ordering::Relaxed);
        assert_eq!(engine.on_trigger(), TriggerOutcome::Skipped);

        engine.dispatching.store(false, Ordering::Relaxed);
        hal.set_tsf(tu_to_tsf(375));
        assert_eq!(
            engine.on_trigger(),
            TriggerOutcome::Transmitted { beacons: 1 }
        );
    }

    #[test]
    fn test_trigger_before_configuration_is_idle() {
        let hal = Arc::new(SimulatedTimebase::new());
        let source = Arc::new(SimBeaconSource::new());
        let recovery = Arc::new(CountingRecovery::new());
        let engine = BeaconEngine::new(
            hal.clone(),
            source,
            recovery,
            OpMode::Ap,
            Default::default(),
        );
        engine.activate_vif(1, OpMode::Ap).unwrap();

        assert_eq!(engine.on_trigger(), TriggerOutcome::Idle);
        assert!(hal.beacon_chains().is_empty());
    }
}
