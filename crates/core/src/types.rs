use serde::{Deserialize, Serialize};

pub type VifId = u64;
/// Time unit of the beacon clock, 1024 microseconds.
pub type Tu = u32;
/// Raw hardware timebase value in microseconds.
pub type Tsf = u64;

pub const TU_MICROS: u64 = 1024;
pub const DEFAULT_BEACON_INTERVAL: Tu = 100;
pub const DEFAULT_LISTEN_INTERVAL: u32 = 1;
pub const DEFAULT_BMISS_LIMIT: u32 = 10;
/// Beacon transmit slots (and pooled beacon buffers) per radio.
pub const BEACON_SLOTS: usize = 4;
/// Consecutive misses before the beacon queue is declared stuck.
pub const BSTUCK_THRESHOLD: u32 = 9;
/// 802.11 management header length; the timestamp field follows it.
pub const MGMT_HEADER_LEN: usize = 24;
pub const TIMESTAMP_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpMode {
    Ap,
    Adhoc,
    Sta,
}

/// Converts a timebase reading to TU, truncating to the 32-bit beacon clock.
pub fn tsf_to_tu(tsf: Tsf) -> Tu {
    (tsf >> 10) as Tu
}

pub fn tu_to_tsf(tu: Tu) -> Tsf {
    (tu as Tsf) << 10
}

pub fn ms_to_tu(ms: u32) -> Tu {
    ((ms as u64 * 1000) / TU_MICROS) as Tu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tu_conversion_shift() {
        assert_eq!(tsf_to_tu(1024), 1);
        assert_eq!(tsf_to_tu(1023), 0);
        assert_eq!(tu_to_tsf(100), 102_400);
        assert_eq!(tsf_to_tu(tu_to_tsf(250)), 250);
    }

    #[test]
    fn test_ms_to_tu_rounds_down() {
        // 100ms is 97.65 TU
        assert_eq!(ms_to_tu(100), 97);
        assert_eq!(ms_to_tu(0), 0);
    }
}
