//! Async driver that stands in for the hardware beacon alert interrupt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use tokio::time::{sleep, sleep_until, Duration, Instant};

use crate::context::BeaconEngine;

/// How long to wait before re-checking an engine with no armed trigger.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Fires [`BeaconEngine::on_trigger`] on the armed plan's cadence.
pub struct TriggerLoop {
    engine: Arc<BeaconEngine>,
    cycles: AtomicU64,
}

impl TriggerLoop {
    pub fn new(engine: Arc<BeaconEngine>) -> Self {
        Self {
            engine,
            cycles: AtomicU64::new(0),
        }
    }

    /// Runs until the task is dropped. While the engine has no armed
    /// trigger interval the loop idles and re-checks the plan.
    pub async fn run(&self) {
        info!("trigger loop started");
        let mut next = Instant::now();
        loop {
            self.step(&mut next).await;
        }
    }

    /// Drives `n` loop steps. Only steps with an armed trigger interval
    /// dispatch; the rest idle-poll.
    pub async fn run_cycles(&self, n: u64) {
        let mut next = Instant::now();
        for _ in 0..n {
            self.step(&mut next).await;
        }
    }

    async fn step(&self, next: &mut Instant) {
        let Some(period) = self.engine.trigger_period() else {
            sleep(IDLE_POLL).await;
            *next = Instant::now();
            return;
        };
        *next += period;
        sleep_until(*next).await;
        let outcome = self.engine.on_trigger();
        self.cycles.fetch_add(1, Ordering::Relaxed);
        debug!("trigger cycle: {:?}", outcome);
    }

    /// Trigger periods dispatched so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tbtt_core::{BeaconConfig, OpMode};

    use crate::simulated::{CountingRecovery, SimBeaconSource, SimulatedTimebase};

    fn fast_engine() -> Arc<BeaconEngine> {
        let hal = Arc::new(SimulatedTimebase::anchored());
        let source = Arc::new(SimBeaconSource::new());
        let recovery = Arc::new(CountingRecovery::new());
        let config = BeaconConfig {
            // ~10ms per beacon keeps the test quick
            beacon_interval: 10,
            staggered: false,
            ..Default::default()
        };
        let engine = BeaconEngine::new(hal, source, recovery, OpMode::Ap, config);
        engine.activate_vif(1, OpMode::Ap).unwrap();
        engine.configure_beacons(None);
        engine
    }

    #[tokio::test]
    async fn test_loop_fires_once_per_interval() {
        let engine = fast_engine();
        let driver = TriggerLoop::new(engine.clone());
        driver.run_cycles(4).await;

        assert_eq!(driver.cycles(), 4);
        let (triggers, beacons, _, _) = engine.get_stats();
        assert_eq!(triggers, 4);
        assert_eq!(beacons, 4);
    }

    #[test]
    fn test_loop_runs_under_plain_block_on() {
        let engine = fast_engine();
        let driver = TriggerLoop::new(engine.clone());
        tokio_test::block_on(driver.run_cycles(2));

        assert_eq!(driver.cycles(), 2);
        assert_eq!(engine.get_stats().0, 2);
    }
}
