//! Core timing and slot bookkeeping for the tbtt beacon engine.

pub mod miss;
pub mod slots;
pub mod slottime;
pub mod timers;
pub mod types;

pub use miss::{MissCounter, MissOutcome};
pub use slots::SlotTable;
pub use slottime::{SlotTimeState, SlotTimeSync};
pub use timers::{plan, BeaconConfig, BeaconQueueParams, StaTimers, TimerPlan};
pub use types::{ms_to_tu, tsf_to_tu, tu_to_tsf, OpMode, Tsf, Tu, VifId};
