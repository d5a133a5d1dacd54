//! simulation scenarios for the tbtt beacon engine

pub mod scenarios;

use tbtt_core::BeaconConfig;

pub struct ScenarioPresets;

impl ScenarioPresets {
    /// Several BSSes sharing one radio, beacons staggered across the interval.
    pub fn staggered_multi_bss() -> BeaconConfig {
        BeaconConfig::default()
    }

    /// Every beacon sent back-to-back at the top of the interval.
    pub fn burst_multi_bss() -> BeaconConfig {
        BeaconConfig {
            staggered: false,
            ..BeaconConfig::default()
        }
    }

    /// Group traffic released only on every second beacon.
    pub fn dtim_every_other() -> BeaconConfig {
        BeaconConfig {
            dtim_period: 2,
            ..BeaconConfig::default()
        }
    }

    /// Power-saving client waking every fourth beacon interval.
    pub fn power_save_station() -> BeaconConfig {
        BeaconConfig {
            listen_interval: 4,
            dtim_period: 2,
            staggered: false,
            ..BeaconConfig::default()
        }
    }
}
