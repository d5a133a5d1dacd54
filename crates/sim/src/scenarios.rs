//! Demo scenarios driving the beacon engine against the simulated timebase

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use indicatif::ProgressBar;
use rand::Rng;

use tbtt_core::types::{BSTUCK_THRESHOLD, TU_MICROS};
use tbtt_core::{tsf_to_tu, tu_to_tsf, BeaconConfig, OpMode};
use tbtt_radio::{
    BeaconEngine, CountingRecovery, SimBeaconSource, SimulatedTimebase, TimebaseHal, TriggerLoop,
    TriggerOutcome,
};

/// Counters collected at the end of a scenario, for the closing summary.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub triggers: u64,
    pub beacons: u64,
    pub cab_bursts: u64,
    pub cab_drained: u64,
    pub resets: u64,
}

impl ScenarioReport {
    fn collect(name: &'static str, engine: &BeaconEngine, recovery: &CountingRecovery) -> Self {
        let (triggers, beacons, cab_bursts, cab_drained) = engine.get_stats();
        Self {
            name,
            triggers,
            beacons,
            cab_bursts,
            cab_drained,
            resets: recovery.resets(),
        }
    }
}

fn engine_with(
    hal: Arc<SimulatedTimebase>,
    opmode: OpMode,
    config: BeaconConfig,
) -> (
    Arc<BeaconEngine>,
    Arc<SimBeaconSource>,
    Arc<CountingRecovery>,
) {
    let source = Arc::new(SimBeaconSource::new());
    let recovery = Arc::new(CountingRecovery::new());
    let engine = BeaconEngine::new(hal, source.clone(), recovery.clone(), opmode, config);
    (engine, source, recovery)
}

pub async fn staggered_multi_bss(config: BeaconConfig, num_bss: u64) -> ScenarioReport {
    println!("Starting staggered beacon test with {} BSSes", num_bss);
    println!(
        "Beacon config: interval {} TU, {} slots, staggered {}",
        config.beacon_interval, config.slots, config.staggered
    );

    let hal = Arc::new(SimulatedTimebase::new());
    let (engine, _source, recovery) = engine_with(hal.clone(), OpMode::Ap, config);

    println!("\n=== Bringing up interfaces ===");
    for id in 1..=num_bss {
        match engine.activate_vif(id, OpMode::Ap) {
            Ok(slot) => println!("✓ BSS {} assigned beacon slot {:?}", id, slot),
            Err(e) => println!("✗ BSS {} failed to activate: {}", id, e),
        }
    }
    engine.configure_beacons(None);
    let plan = engine.timer_plan();
    println!(
        "Timers armed: next tbtt {} TU, trigger every {} TU",
        plan.next_tbtt, plan.trigger_interval
    );

    println!("\n=== Driving 12 trigger periods ===");
    println!("(a 9 us slot time change is requested on the way in)");
    hal.set_tsf(tu_to_tsf(375));
    engine.request_slot_time(9);
    let mut committed = 0;
    for _ in 0..12 {
        let now_tu = tsf_to_tu(hal.now_tsf());
        match engine.on_trigger() {
            TriggerOutcome::Transmitted { .. } => {
                let chains = hal.beacon_chains();
                let beacon = chains.last().unwrap().first().unwrap().clone();
                println!(
                    "  t={:>4} TU  slot {:?} -> BSS {}  timestamp field {}",
                    now_tu,
                    beacon.slot,
                    beacon.vif,
                    hex::encode(&beacon.frame[24..32])
                );
            }
            TriggerOutcome::Idle => {
                println!("  t={:>4} TU  spacing slot, nothing due", now_tu);
            }
            other => println!("  t={:>4} TU  {:?}", now_tu, other),
        }
        let slot_times = hal.slot_times();
        if slot_times.len() > committed {
            committed = slot_times.len();
            println!(
                "  ✓ slot time {} us committed once the requesting slot came around again",
                slot_times.last().unwrap()
            );
        }
        hal.advance(tu_to_tsf(plan.trigger_interval));
    }

    let (triggers, beacons, _, _) = engine.get_stats();
    println!("\n{} triggers, {} beacons handed to hardware", triggers, beacons);
    println!("Later slots carry their offset in the timestamp field, so every BSS's");
    println!("clients still see a timestamp that counts from that BSS's own TBTT.");

    engine.shutdown();
    ScenarioReport::collect("staggered multi-BSS", &engine, &recovery)
}

pub async fn burst_trigger_loop(config: BeaconConfig, num_bss: u64) -> ScenarioReport {
    // one period is 102.4 ms of wall clock at the default interval, so the
    // demo compresses it
    let config = BeaconConfig {
        beacon_interval: 20,
        ..config
    };
    println!("Starting burst-mode run under the async trigger loop");
    println!(
        "{} BSSes, interval compressed to {} TU ({:?} wall clock per trigger)",
        num_bss,
        config.beacon_interval,
        Duration::from_micros(config.beacon_interval as u64 * TU_MICROS)
    );

    let hal = Arc::new(SimulatedTimebase::anchored());
    hal.set_airtime_jitter(40.0);
    println!("Timebase anchored to the wall clock, reads jittered by ±40 us");
    let (engine, _source, recovery) = engine_with(hal.clone(), OpMode::Ap, config);

    for id in 1..=num_bss {
        engine.activate_vif(id, OpMode::Ap).unwrap();
    }
    engine.configure_beacons(None);

    let runner = TriggerLoop::new(engine.clone());
    let start = tokio::time::Instant::now();
    runner.run_cycles(6).await;
    let elapsed = start.elapsed();

    log::info!("burst run: {} cycles in {:?}", runner.cycles(), elapsed);
    println!("\n{} trigger cycles in {:?}", runner.cycles(), elapsed);
    if let Some(chain) = hal.beacon_chains().last() {
        let order: Vec<String> = chain
            .iter()
            .map(|b| format!("BSS {} (slot {:?})", b.vif, b.slot))
            .collect();
        println!("Last chain, in slot order: {}", order.join(", "));
    }
    let (triggers, beacons, _, _) = engine.get_stats();
    println!(
        "✓ every interface beacons on every trigger: {} triggers, {} beacons ({} per trigger)",
        triggers,
        beacons,
        beacons / triggers.max(1)
    );

    engine.shutdown();
    ScenarioReport::collect("burst trigger loop", &engine, &recovery)
}

pub async fn dtim_cab_delivery(config: BeaconConfig) -> ScenarioReport {
    println!(
        "Starting DTIM-gated group traffic test (dtim period {})",
        config.dtim_period
    );

    let hal = Arc::new(SimulatedTimebase::new());
    let (engine, source, recovery) = engine_with(hal.clone(), OpMode::Ap, config.clone());
    source.set_dtim_period(config.dtim_period);

    engine.activate_vif(1, OpMode::Ap).unwrap();
    engine.activate_vif(2, OpMode::Ap).unwrap();
    engine.configure_beacons(None);

    let mut rng = rand::rng();
    println!("\n=== BSS 1 buffers group traffic for sleeping clients ===");
    for _ in 0..3 {
        let size = rng.random_range(64..=256);
        let depth = engine.queue_cab(1, Bytes::from(vec![0xAA; size])).unwrap();
        println!(
            "  queued {} byte group frame on BSS 1 (queue depth {})",
            size, depth
        );
    }

    hal.set_tsf(tu_to_tsf(375));
    engine.on_trigger();
    println!(
        "✓ DTIM beacon for BSS 1: CAB burst of {} frames follows it",
        hal.cab_bursts().last().map(|b| b.len()).unwrap_or(0)
    );

    println!("\n=== BSS 2 hits its DTIM while BSS 1's burst still sits in hardware ===");
    for _ in 0..2 {
        let size = rng.random_range(64..=256);
        engine.queue_cab(2, Bytes::from(vec![0xBB; size])).unwrap();
        println!("  queued {} byte group frame on BSS 2", size);
    }
    hal.advance(tu_to_tsf(25));
    engine.on_trigger();
    println!(
        "✗ {} stale frames stopped and failed back to the provider ({} cab stop request)",
        engine.get_stats().3,
        hal.stop_cab_calls()
    );
    println!(
        "✓ BSS 2's burst of {} frames took the airtime instead",
        hal.cab_bursts().last().map(|b| b.len()).unwrap_or(0)
    );
    println!(
        "✓ {} frames delivered and completed",
        engine.cab_tx_completed()
    );

    println!("\n=== Off-DTIM beacons hold traffic back ===");
    engine.queue_cab(1, Bytes::from(vec![0xCC; 100])).unwrap();
    hal.advance(tu_to_tsf(75));
    let bursts_before = hal.cab_bursts().len();
    engine.on_trigger();
    if hal.cab_bursts().len() == bursts_before {
        println!(
            "✓ beacon at t={} TU was not a DTIM; the frame stayed buffered",
            tsf_to_tu(hal.now_tsf())
        );
    }
    hal.advance(tu_to_tsf(100));
    engine.on_trigger();
    println!(
        "✓ the next DTIM released it ({} frame burst at t={} TU)",
        hal.cab_bursts().last().map(|b| b.len()).unwrap_or(0),
        tsf_to_tu(hal.now_tsf())
    );
    println!(
        "✓ {} frame delivered and completed",
        engine.cab_tx_completed()
    );

    engine.shutdown();
    ScenarioReport::collect("DTIM group traffic", &engine, &recovery)
}

pub async fn stuck_beacon_recovery(config: BeaconConfig) -> ScenarioReport {
    println!("Starting stuck beacon recovery test");
    println!(
        "Hardware queue refuses to drain; recovery fires at {} consecutive misses",
        BSTUCK_THRESHOLD
    );

    let hal = Arc::new(SimulatedTimebase::new());
    let (engine, _source, recovery) = engine_with(hal.clone(), OpMode::Ap, config);
    engine.activate_vif(1, OpMode::Ap).unwrap();
    engine.configure_beacons(None);

    hal.set_tsf(tu_to_tsf(375));
    hal.set_tx_pending(true);

    let bar = ProgressBar::new(BSTUCK_THRESHOLD as u64);
    for _ in 0..BSTUCK_THRESHOLD {
        match engine.on_trigger() {
            TriggerOutcome::Missed { consecutive, stuck } => {
                bar.inc(1);
                if stuck {
                    bar.finish();
                    println!(
                        "✗ beacon officially stuck after {} consecutive misses",
                        consecutive
                    );
                }
            }
            other => println!("unexpected outcome while stuck: {:?}", other),
        }
        hal.advance(tu_to_tsf(25));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("✓ radio resets issued: {}", recovery.resets());

    hal.set_tx_pending(false);
    hal.advance(tu_to_tsf(75));
    match engine.on_trigger() {
        TriggerOutcome::Transmitted { beacons } => println!(
            "✓ queue drained after reset; {} beacon back on the air at t={} TU (miss count {})",
            beacons,
            tsf_to_tu(hal.now_tsf()),
            engine.miss_count()
        ),
        other => println!("still unhappy after the reset: {:?}", other),
    }

    engine.shutdown();
    ScenarioReport::collect("stuck beacon recovery", &engine, &recovery)
}

pub async fn station_power_save(config: BeaconConfig) -> ScenarioReport {
    println!("Starting station power-save timer test");
    println!(
        "listen interval {}, dtim period {}, miss timeout {} TU",
        config.listen_interval, config.dtim_period, config.bmiss_timeout
    );

    let hal = Arc::new(SimulatedTimebase::new());
    let (engine, _source, recovery) = engine_with(hal.clone(), OpMode::Sta, config);
    engine.activate_vif(1, OpMode::Sta).unwrap();

    // a beacon from the AP landed at 380 TU; the clock has moved on since
    hal.set_tsf(tu_to_tsf(450));
    engine.resync(1, tu_to_tsf(380)).unwrap();

    let plan = engine.timer_plan();
    let sta = plan.sta.unwrap();
    println!("\n=== Sleep schedule from the received beacon ===");
    println!("  next tbtt       : {} TU", plan.next_tbtt);
    println!(
        "  dtim period     : {} TU (next dtim at {} TU)",
        sta.dtim_period, sta.next_dtim
    );
    println!(
        "  cfp period      : {} TU (next cfp at {} TU)",
        sta.cfp_period, sta.next_cfp
    );
    println!("  bmiss threshold : {} missed beacons", sta.bmiss_threshold);
    println!("  sleep window    : {} TU", sta.sleep_duration);

    match hal.last_mask() {
        Some(mask) => println!(
            "✓ trigger interrupt {}, beacon-miss interrupt {}",
            if mask.swba { "on" } else { "off" },
            if mask.bmiss { "armed" } else { "off" }
        ),
        None => println!("✗ no interrupt mask applied"),
    }
    if engine.trigger_period().is_none() {
        println!("✓ no local trigger loop; the station only listens");
    }

    engine.shutdown();
    ScenarioReport::collect("station power save", &engine, &recovery)
}
