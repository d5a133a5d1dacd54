//! Beacon timer planning.
//!
//! Turns a beacon configuration plus the current timebase into the values the
//! hardware timers are armed with: the next target beacon transmission time,
//! the trigger interval, and for station operation the DTIM/CFP schedule,
//! sleep window and beacon-miss threshold.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::types::{
    ms_to_tu, tsf_to_tu, OpMode, Tsf, Tu, BEACON_SLOTS, DEFAULT_BEACON_INTERVAL,
    DEFAULT_BMISS_LIMIT, DEFAULT_LISTEN_INTERVAL,
};

/// Slack added to the current clock before arming timers, in TU.
const FUDGE: Tu = 2;
/// Base power-save sleep window before alignment to the listen schedule.
const SLEEP_BASE_MS: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconConfig {
    /// Beacon interval in TU.
    pub beacon_interval: Tu,
    /// Beacon intervals between wakeups when power-saving.
    pub listen_interval: u32,
    /// Beacon intervals between DTIM beacons.
    pub dtim_period: u32,
    /// Beacons remaining until the next DTIM, per the last received beacon.
    pub dtim_count: u32,
    /// Time without beacons before declaring the AP lost, in TU.
    pub bmiss_timeout: Tu,
    /// Stagger multi-BSS beacons across the interval instead of bursting.
    pub staggered: bool,
    /// Beacon slot and buffer capacity.
    pub slots: usize,
    /// Suppress locally generated beacons (WDS client on an AP radio).
    pub no_local_beacons: bool,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            beacon_interval: DEFAULT_BEACON_INTERVAL,
            listen_interval: DEFAULT_LISTEN_INTERVAL,
            dtim_period: 1,
            dtim_count: 0,
            bmiss_timeout: DEFAULT_BMISS_LIMIT * DEFAULT_BEACON_INTERVAL,
            staggered: true,
            slots: BEACON_SLOTS,
            no_local_beacons: false,
        }
    }
}

/// Contention parameters for the hardware beacon queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconQueueParams {
    pub aifs: u32,
    pub cwmin: u32,
    pub cwmax: u32,
}

impl Default for BeaconQueueParams {
    fn default() -> Self {
        // plain DCF access parameters
        Self {
            aifs: 2,
            cwmin: 15,
            cwmax: 1023,
        }
    }
}

impl BeaconQueueParams {
    /// Queue parameters for `mode`, derived from the radio's base profile.
    pub fn for_opmode(mode: OpMode, base: &BeaconQueueParams) -> Self {
        match mode {
            // Always burst out beacon and CAB traffic.
            OpMode::Ap => Self {
                aifs: 1,
                cwmin: 0,
                cwmax: 0,
            },
            // Ad hoc; the important thing is to use 2x cwmin.
            _ => Self {
                aifs: base.aifs,
                cwmin: base.cwmin * 2,
                cwmax: base.cwmax,
            },
        }
    }
}

/// Station-mode sub-timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaTimers {
    /// DTIM sub-period in TU.
    pub dtim_period: Tu,
    pub next_dtim: Tu,
    /// Contention-free period in TU (equal to the DTIM period, no PCF).
    pub cfp_period: Tu,
    pub next_cfp: Tu,
    /// Consecutive missed beacons before a miss interrupt.
    pub bmiss_threshold: u32,
    /// Power-save sleep window in TU.
    pub sleep_duration: Tu,
}

/// Everything the timebase adapter needs to arm beacon timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerPlan {
    pub enabled: bool,
    /// Full beacon interval in TU.
    pub beacon_interval: Tu,
    /// Interval between trigger events; the beacon interval divided across
    /// the slot table when staggering.
    pub trigger_interval: Tu,
    pub next_tbtt: Tu,
    /// Restart the hardware clock before arming, so `next_tbtt` counts from
    /// zero.
    pub reset_tsf: bool,
    /// Arm the software beacon alert interrupt.
    pub swba: bool,
    /// Arm the beacon miss interrupt.
    pub bmiss: bool,
    pub sta: Option<StaTimers>,
}

impl TimerPlan {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            beacon_interval: 0,
            trigger_interval: 0,
            next_tbtt: 0,
            reset_tsf: false,
            swba: false,
            bmiss: false,
            sta: None,
        }
    }
}

fn round_up(value: Tu, align: Tu) -> Tu {
    if align == 0 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

/// Computes the timer plan for a radio in `radio_mode` whose `vif_mode`
/// interface is being (re)configured.
///
/// `last_tstamp` is the timestamp of the last beacon observed for the
/// interface (zero when there is none) and `now` the current timebase.
/// `self_linked` reports whether the hardware can loop an ad hoc beacon
/// without per-interval trigger interrupts.
pub fn plan(
    cfg: &BeaconConfig,
    radio_mode: OpMode,
    vif_mode: OpMode,
    last_tstamp: Tsf,
    now: Tsf,
    self_linked: bool,
) -> TimerPlan {
    let full_interval = cfg.beacon_interval;
    if full_interval == 0 {
        return TimerPlan::disabled();
    }
    let capacity = cfg.slots.max(1) as Tu;

    let mut intval = full_interval;
    let mut nexttbtt = tsf_to_tu(last_tstamp);
    if radio_mode == OpMode::Ap {
        if cfg.staggered {
            intval = (full_interval / capacity).max(1);
        }
        if cfg.no_local_beacons && vif_mode == OpMode::Ap {
            nexttbtt = 0;
        }
    }

    let fresh = nexttbtt == 0;
    if fresh {
        nexttbtt = intval;
    } else {
        nexttbtt = round_up(nexttbtt, intval);
    }
    let horizon = tsf_to_tu(now).wrapping_add(FUDGE);
    debug!(
        "plan: nexttbtt {} intval {} ({}) horizon {}",
        nexttbtt, intval, full_interval, horizon
    );

    let wants_sta_timers = radio_mode == OpMode::Sta
        || (radio_mode == OpMode::Ap && vif_mode == OpMode::Sta && cfg.no_local_beacons);
    if wants_sta_timers {
        return plan_sta(cfg, intval, full_interval, nexttbtt, horizon);
    }

    let mut reset_tsf = false;
    let mut swba = true;
    match radio_mode {
        OpMode::Adhoc => {
            if fresh {
                // no timestamp history; restart the clock so the first
                // beacon lands one interval after the reset
                reset_tsf = true;
            } else {
                loop {
                    nexttbtt = nexttbtt.wrapping_add(intval);
                    if nexttbtt >= horizon {
                        break;
                    }
                }
            }
            // with a self-linked descriptor the hardware sends beacons on
            // its own and no per-interval trigger is needed
            swba = !self_linked;
        }
        _ => {
            while nexttbtt < horizon {
                nexttbtt = nexttbtt.wrapping_add(intval);
            }
        }
    }

    TimerPlan {
        enabled: true,
        beacon_interval: full_interval,
        trigger_interval: intval,
        next_tbtt: nexttbtt,
        reset_tsf,
        swba,
        bmiss: false,
        sta: None,
    }
}

fn plan_sta(cfg: &BeaconConfig, intval: Tu, full_interval: Tu, tbtt: Tu, horizon: Tu) -> TimerPlan {
    let mut nexttbtt = tbtt;
    let dtimperiod = cfg.dtim_period.max(1);
    let mut dtimcount = if cfg.dtim_count >= dtimperiod {
        0
    } else {
        cfg.dtim_count
    };
    let cfpperiod: u32 = 1; // no contention-free period support
    let mut cfpcount: u32 = 0;
    let mut sleepduration = cfg.listen_interval.saturating_mul(intval);
    if sleepduration == 0 {
        sleepduration = intval;
    }

    // Pull nexttbtt forward past the current clock, rolling the DTIM and
    // CFP counters through every skipped interval.
    loop {
        nexttbtt = nexttbtt.wrapping_add(intval);
        if dtimcount == 0 {
            dtimcount = dtimperiod - 1;
            if cfpcount == 0 {
                cfpcount = cfpperiod - 1;
            } else {
                cfpcount -= 1;
            }
        } else {
            dtimcount -= 1;
        }
        if nexttbtt >= horizon {
            break;
        }
    }

    let dtim_period_tu = dtimperiod.saturating_mul(intval);
    let bmiss_threshold = if sleepduration > intval {
        // waking every sleepduration, not every interval; scale the
        // threshold by the listen interval instead of the miss timeout
        cfg.listen_interval.saturating_mul(DEFAULT_BMISS_LIMIT) / 2
    } else {
        cfg.bmiss_timeout.div_ceil(intval).clamp(1, 15)
    };
    let mut sleep_duration = round_up(ms_to_tu(SLEEP_BASE_MS), sleepduration);
    if sleep_duration > dtim_period_tu {
        sleep_duration = dtim_period_tu;
    }

    let sta = StaTimers {
        dtim_period: dtim_period_tu,
        next_dtim: nexttbtt.wrapping_add(dtimcount.saturating_mul(intval)),
        cfp_period: cfpperiod.saturating_mul(dtim_period_tu),
        next_cfp: nexttbtt
            .wrapping_add(dtimcount.saturating_mul(intval))
            .wrapping_add(cfpcount.saturating_mul(dtim_period_tu)),
        bmiss_threshold,
        sleep_duration,
    };
    debug!(
        "plan: sta nexttbtt {} dtim {} nextdtim {} bmiss {} sleep {} cfp {} nextcfp {}",
        nexttbtt,
        sta.dtim_period,
        sta.next_dtim,
        sta.bmiss_threshold,
        sta.sleep_duration,
        sta.cfp_period,
        sta.next_cfp
    );

    TimerPlan {
        enabled: true,
        beacon_interval: full_interval,
        trigger_interval: intval,
        next_tbtt: nexttbtt,
        reset_tsf: false,
        swba: false,
        bmiss: true,
        sta: Some(sta),
    }
}
