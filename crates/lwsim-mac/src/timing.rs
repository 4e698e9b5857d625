//! Class A/B timing helpers.
//!
//! RX1 opens a configurable delay after the uplink ends, RX2 one second
//! later. Class-B ping slots are anchored to the most recent beacon; a
//! node's clock offset and the configured periodicity shift and stretch
//! the grid.

use lwsim_common::SimTime;

/// Default RX1 delay, seconds.
pub const DEFAULT_RX_DELAY_S: f64 = 1.0;
/// RX2 opens this long after RX1.
pub const RX2_EXTRA_DELAY_S: f64 = 1.0;
/// Default beacon period, seconds.
pub const DEFAULT_BEACON_INTERVAL_S: f64 = 128.0;
/// Default ping-slot spacing, seconds.
pub const DEFAULT_PING_SLOT_INTERVAL_S: f64 = 1.0;
/// Default offset of the first ping slot after a beacon, seconds.
pub const DEFAULT_PING_SLOT_OFFSET_S: f64 = 2.0;

/// RX1 opening time for an uplink ending at `uplink_end`.
pub fn compute_rx1(uplink_end: SimTime, rx_delay_s: f64) -> SimTime {
    uplink_end + SimTime::from_secs(rx_delay_s)
}

/// RX2 opening time for an uplink ending at `uplink_end`.
pub fn compute_rx2(uplink_end: SimTime, rx_delay_s: f64) -> SimTime {
    uplink_end + SimTime::from_secs(rx_delay_s + RX2_EXTRA_DELAY_S)
}

/// Next beacon emission strictly after `after`.
///
/// `drift` stretches the nominal interval (relative, e.g. 1e-5); the grid
/// is anchored at `last_beacon` when one has been seen.
pub fn next_beacon_time(
    after: SimTime,
    beacon_interval_s: f64,
    last_beacon: Option<SimTime>,
    drift: f64,
) -> SimTime {
    let interval = beacon_interval_s * (1.0 + drift);
    let after_s = after.as_secs_f64();
    let anchor = last_beacon.map(|t| t.as_secs_f64()).unwrap_or(0.0);
    let mut k = ((after_s - anchor) / interval).floor().max(0.0);
    loop {
        let t = anchor + k * interval;
        if t > after_s + 1e-12 {
            return SimTime::from_secs(t);
        }
        k += 1.0;
    }
}

/// First ping slot at or after `after` for a node.
///
/// Slots sit at `beacon + offset + k · interval · 2^periodicity`, with
/// the node's clock offset applied to its view of the beacon.
pub fn next_ping_slot_time(
    after: SimTime,
    last_beacon: SimTime,
    beacon_interval_s: f64,
    ping_slot_interval_s: f64,
    ping_slot_offset_s: f64,
    periodicity: u8,
    clock_offset_s: f64,
) -> SimTime {
    let interval = ping_slot_interval_s * (1 << periodicity.min(7)) as f64;
    let after_s = after.as_secs_f64();
    let mut beacon_start = last_beacon.as_secs_f64() + clock_offset_s;

    // Slots only exist inside their beacon period; a request past the
    // period's last slot rolls over to the next period's grid.
    loop {
        let period_end = beacon_start + beacon_interval_s;
        let base = beacon_start + ping_slot_offset_s;
        let candidate = if after_s <= base {
            base
        } else {
            base + ((after_s - base) / interval).ceil() * interval
        };
        if candidate < period_end {
            return SimTime::from_secs(candidate);
        }
        beacon_start = period_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_windows_are_one_second_apart() {
        let end = SimTime::from_secs(100.0);
        let rx1 = compute_rx1(end, 1.0);
        let rx2 = compute_rx2(end, 1.0);
        assert_eq!(rx1, SimTime::from_secs(101.0));
        assert_eq!(rx2, SimTime::from_secs(102.0));
    }

    #[test]
    fn beacons_fall_on_the_grid() {
        let next = next_beacon_time(SimTime::from_secs(0.0), 128.0, Some(SimTime::ZERO), 0.0);
        assert_eq!(next, SimTime::from_secs(128.0));
        let later = next_beacon_time(SimTime::from_secs(300.0), 128.0, Some(SimTime::ZERO), 0.0);
        assert_eq!(later, SimTime::from_secs(384.0));
    }

    #[test]
    fn beacon_drift_stretches_the_interval() {
        let drifted = next_beacon_time(SimTime::ZERO, 128.0, Some(SimTime::ZERO), 0.01);
        assert!((drifted.as_secs_f64() - 129.28).abs() < 1e-9);
    }

    #[test]
    fn first_ping_slot_sits_at_beacon_plus_offset() {
        let slot = next_ping_slot_time(
            SimTime::from_secs(0.0),
            SimTime::ZERO,
            128.0,
            1.0,
            2.0,
            0,
            0.0,
        );
        assert_eq!(slot, SimTime::from_secs(2.0));
    }

    #[test]
    fn ping_slots_advance_by_interval() {
        let slot = next_ping_slot_time(
            SimTime::from_secs(5.5),
            SimTime::ZERO,
            128.0,
            1.0,
            2.0,
            0,
            0.0,
        );
        assert_eq!(slot, SimTime::from_secs(6.0));
    }

    #[test]
    fn periodicity_doubles_the_spacing() {
        let slot = next_ping_slot_time(
            SimTime::from_secs(2.5),
            SimTime::ZERO,
            128.0,
            1.0,
            2.0,
            2,
            0.0,
        );
        // Slots every 4 s starting at 2 s.
        assert_eq!(slot, SimTime::from_secs(6.0));
    }

    #[test]
    fn request_beyond_the_beacon_period_rolls_over() {
        let slot = next_ping_slot_time(
            SimTime::from_secs(131.0),
            SimTime::ZERO,
            128.0,
            1.0,
            2.0,
            0,
            0.0,
        );
        assert_eq!(slot, SimTime::from_secs(131.0));
        // 129 s is past the last slot of the first period; the next grid
        // starts at 128 + 2.
        let slot2 = next_ping_slot_time(
            SimTime::from_secs(129.0),
            SimTime::ZERO,
            128.0,
            1.0,
            2.0,
            0,
            0.0,
        );
        assert_eq!(slot2, SimTime::from_secs(130.0));
    }
}
