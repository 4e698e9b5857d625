//! End-device state.
//!
//! A node owns its radio state machine, frame counters, ADR client
//! state, Poisson arrival clock, duty-cycle deadlines and battery. The
//! arrival clock is a theoretical Poisson process: backpressure (a frame
//! still in flight, a duty-cycle block) postpones the transmission start
//! but never discards or re-draws the sample, so the inter-arrival
//! distribution stays exponential.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp};
use serde::Serialize;
use tracing::debug;

use lwsim_common::{NodeId, Position, SimTime};
use lwsim_mac::frames::{DataFrame, DownlinkFrame, LinkAdrReq, FCTRL_ACK};
use lwsim_mac::region::Region;
use lwsim_phy::energy::{EnergyAccumulator, EnergyProfile, RadioState};
use lwsim_model::DeviceClass;

/// Default uplinks without downlink before ADRACKReq is set.
pub const ADR_ACK_LIMIT: u32 = 64;
/// Further uplinks between successive ADR fallback escalations.
pub const ADR_ACK_DELAY: u32 = 32;

/// Why a transmission start moved past its drawn arrival time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleReason {
    Poisson,
    Periodic,
    Overlap,
    DutyCycle,
    Retransmission,
}

/// One row of the arrival log: drawn arrival vs. actual start.
#[derive(Debug, Clone, Serialize)]
pub struct IntervalRecord {
    pub requested_s: f64,
    pub tx_s: f64,
    pub reason: ScheduleReason,
}

/// OTAA session state.
#[derive(Debug, Clone)]
pub struct Session {
    pub dev_addr: u32,
    pub nwk_skey: [u8; 16],
    pub app_skey: [u8; 16],
}

#[derive(Debug, Clone)]
pub struct MobilityState {
    pub target: Position,
    pub speed_mps: f64,
}

/// A LoRaWAN end-device.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub position: Position,
    pub initial_position: Position,
    pub class: DeviceClass,

    pub sf: u8,
    pub initial_sf: u8,
    pub tx_power_dbm: f64,
    pub initial_tx_power_dbm: f64,
    pub channel_mask: u16,
    /// Index into the scenario channel plan, refreshed at each TX.
    pub channel_index: usize,

    pub fcnt_up: u32,
    pub fcnt_down: u32,
    pub dev_nonce: u16,
    pub app_key: [u8; 16],
    pub activated: bool,
    pub session: Option<Session>,

    // ADR client state
    pub adr_enabled: bool,
    pub adr_ack_cnt: u32,
    pub adr_ack_limit: u32,
    pub adr_ack_delay: u32,
    pub adr_ack_req: bool,
    pub nb_trans: u8,
    pub nb_trans_left: u8,

    // Radio & energy
    pub state: RadioState,
    /// Start of the current state, for lazy energy integration.
    pub state_since: SimTime,
    pub profile: EnergyProfile,
    pub energy: EnergyAccumulator,
    pub energy_consumed_j: f64,
    pub battery_capacity_j: Option<f64>,
    pub battery_remaining_j: f64,
    pub alive: bool,

    // Transmission bookkeeping
    pub in_flight: bool,
    pub current_end_time: Option<SimTime>,
    pub last_tx_time: Option<SimTime>,
    pub last_airtime_s: f64,
    pub total_airtime_s: f64,
    pub last_uplink_end: Option<SimTime>,
    /// Theoretical Poisson arrival clock, seconds.
    pub arrival_clock_s: f64,
    pub interval_log: Vec<IntervalRecord>,

    // Counters
    pub packets_sent: u32,
    pub packets_success: u32,
    pub packets_collision: u32,
    pub tx_attempted: u32,
    pub rx_delivered: u32,
    pub downlink_pending: u32,
    pub acks_received: u32,

    pub last_rssi_dbm: Option<f64>,
    pub last_snr_db: Option<f64>,

    // Class B
    pub ping_slot_periodicity: u8,
    pub last_beacon: Option<SimTime>,
    pub clock_offset_s: f64,
    pub missed_beacons: u32,

    pub mobility: Option<MobilityState>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        position: Position,
        sf: u8,
        tx_power_dbm: f64,
        class: DeviceClass,
        profile: EnergyProfile,
        battery_capacity_j: Option<f64>,
        clock_offset_s: f64,
    ) -> Self {
        Node {
            id,
            position,
            initial_position: position,
            class,
            sf,
            initial_sf: sf,
            tx_power_dbm,
            initial_tx_power_dbm: tx_power_dbm,
            channel_mask: 0xFFFF,
            channel_index: 0,
            fcnt_up: 0,
            fcnt_down: 0,
            dev_nonce: 0,
            app_key: {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&id.0.to_le_bytes());
                key[4] = 0x2A;
                key
            },
            activated: true,
            session: None,
            adr_enabled: false,
            adr_ack_cnt: 0,
            adr_ack_limit: ADR_ACK_LIMIT,
            adr_ack_delay: ADR_ACK_DELAY,
            adr_ack_req: false,
            nb_trans: 1,
            nb_trans_left: 0,
            state: RadioState::Sleep,
            state_since: SimTime::ZERO,
            profile,
            energy: EnergyAccumulator::default(),
            energy_consumed_j: 0.0,
            battery_capacity_j,
            battery_remaining_j: battery_capacity_j.unwrap_or(f64::INFINITY),
            alive: true,
            in_flight: false,
            current_end_time: None,
            last_tx_time: None,
            last_airtime_s: 0.0,
            total_airtime_s: 0.0,
            last_uplink_end: None,
            arrival_clock_s: 0.0,
            interval_log: Vec::new(),
            packets_sent: 0,
            packets_success: 0,
            packets_collision: 0,
            tx_attempted: 0,
            rx_delivered: 0,
            downlink_pending: 0,
            acks_received: 0,
            last_rssi_dbm: None,
            last_snr_db: None,
            ping_slot_periodicity: 0,
            last_beacon: None,
            clock_offset_s,
            missed_beacons: 0,
            mobility: None,
        }
    }

    /// Packet delivery ratio of this node.
    pub fn pdr(&self) -> f64 {
        if self.tx_attempted == 0 {
            0.0
        } else {
            self.rx_delivered as f64 / self.tx_attempted as f64
        }
    }

    // ------------------------------------------------------------------
    // Arrivals
    // ------------------------------------------------------------------

    /// Advance the Poisson clock by an exponential draw and return the
    /// new arrival time, seconds.
    pub fn next_poisson_arrival_s(&mut self, mean_interval_s: f64, rng: &mut ChaCha8Rng) -> f64 {
        let exp = Exp::new(1.0 / mean_interval_s).expect("mean interval is validated positive");
        self.arrival_clock_s += exp.sample(rng);
        self.arrival_clock_s
    }

    /// Advance the arrival clock by a fixed period.
    pub fn next_periodic_arrival_s(&mut self, period_s: f64) -> f64 {
        self.arrival_clock_s += period_s;
        self.arrival_clock_s
    }

    // ------------------------------------------------------------------
    // Energy
    // ------------------------------------------------------------------

    /// Integrate the energy of the state held since the last update.
    ///
    /// The TX burst itself is billed explicitly at TX start; after it the
    /// state clock is moved past the burst so this integration never
    /// double-counts it.
    pub fn consume_until(&mut self, now: SimTime) {
        if now <= self.state_since {
            return;
        }
        let elapsed = (now - self.state_since).as_secs_f64();
        self.state_since = now;
        if !self.alive {
            return;
        }
        let state = self.state;
        if state == RadioState::Tx {
            return;
        }
        let energy = self
            .profile
            .energy_for(state, elapsed, None)
            .unwrap_or(0.0);
        // Reconcile against E = V·I·t before booking.
        let energy = self
            .profile
            .enforce_energy(state, elapsed, energy, None)
            .unwrap_or(energy);
        if energy > 0.0 {
            self.add_energy(state, energy);
        }
    }

    /// Bill `energy_j` to the books of `state` and drain the battery.
    pub fn add_energy(&mut self, state: RadioState, energy_j: f64) {
        if energy_j <= 0.0 || !self.alive {
            return;
        }
        self.energy.add(state.component(), energy_j);
        self.energy_consumed_j += energy_j;
        if self.battery_capacity_j.is_some() {
            self.battery_remaining_j -= energy_j;
            if self.battery_remaining_j <= 0.0 {
                self.battery_remaining_j = 0.0;
                self.alive = false;
                debug!(node = %self.id, "battery depleted, node stops transmitting");
            }
        }
    }

    // ------------------------------------------------------------------
    // ADR client
    // ------------------------------------------------------------------

    /// Per-uplink ADR bookkeeping: bump the counter, raise ADRACKReq
    /// past the limit, and escalate (power first, then SF) every
    /// `adr_ack_delay` uplinks after that.
    pub fn adr_uplink_bookkeeping(&mut self, region: Region) {
        if !self.adr_enabled {
            return;
        }
        self.adr_ack_cnt += 1;
        if self.adr_ack_cnt < self.adr_ack_limit {
            return;
        }
        self.adr_ack_req = true;
        let past_limit = self.adr_ack_cnt - self.adr_ack_limit;
        if past_limit >= self.adr_ack_delay && past_limit % self.adr_ack_delay == 0 {
            if self.tx_power_dbm < region.max_power_dbm() {
                self.tx_power_dbm = region.max_power_dbm();
                debug!(node = %self.id, "ADR fallback raises TX power to the maximum");
            } else if self.sf < 12 {
                self.sf += 1;
                debug!(node = %self.id, sf = self.sf, "ADR fallback raises spreading factor");
            }
        }
    }

    /// Apply a received downlink: any downlink resets the ADR backoff;
    /// a LinkADRReq payload reconfigures the radio. Secured frames whose
    /// MIC does not verify are dropped.
    pub fn handle_downlink(&mut self, frame: &DownlinkFrame, region: Region) {
        self.downlink_pending = self.downlink_pending.saturating_sub(1);
        if let (DownlinkFrame::Data(data), Some(session)) = (frame, &self.session) {
            if data.mic.is_some()
                && lwsim_mac::crypto::validate_frame(
                    data,
                    &session.nwk_skey,
                    session.dev_addr,
                    lwsim_mac::crypto::Direction::Downlink,
                )
                .is_err()
            {
                debug!(node = %self.id, "downlink dropped: bad MIC");
                return;
            }
        }
        self.adr_ack_cnt = 0;
        self.adr_ack_req = false;
        match frame {
            DownlinkFrame::Data(data) => {
                if data.fctrl & FCTRL_ACK != 0 {
                    self.acks_received += 1;
                }
                if let Ok(req) = LinkAdrReq::from_bytes(&data.payload) {
                    self.apply_link_adr(&req, region);
                }
                self.fcnt_down = self.fcnt_down.max(data.fcnt.wrapping_add(1));
            }
            DownlinkFrame::JoinAccept(_) => {
                self.activated = true;
            }
        }
    }

    fn apply_link_adr(&mut self, req: &LinkAdrReq, region: Region) {
        let sf = region.dr_to_sf(req.data_rate);
        let ladder = region.tx_power_ladder_dbm();
        let power = ladder
            .get(req.tx_power_index as usize)
            .copied()
            .unwrap_or(self.tx_power_dbm);
        if sf != self.sf || (power - self.tx_power_dbm).abs() > 1e-9 {
            debug!(node = %self.id, sf, power, "LinkADRReq applied");
        }
        self.sf = sf;
        self.tx_power_dbm = power;
        if req.ch_mask != 0 {
            self.channel_mask = req.ch_mask;
        }
        if req.nb_trans != 0 {
            self.nb_trans = req.nb_trans;
        }
    }

    // ------------------------------------------------------------------
    // Class B
    // ------------------------------------------------------------------

    /// Register a beacon heard at `time` (or count it lost).
    pub fn observe_beacon(&mut self, time: SimTime, lost: bool) {
        if lost {
            self.missed_beacons += 1;
        } else {
            self.last_beacon = Some(time);
        }
    }

    /// Build the next uplink frame.
    pub fn build_uplink(&mut self, payload_bytes: usize) -> DataFrame {
        let mut frame = DataFrame::uplink(self.fcnt_up, vec![0u8; payload_bytes]);
        if self.adr_ack_req {
            frame.fctrl |= lwsim_mac::frames::FCTRL_ADR_ACK_REQ;
        }
        self.fcnt_up = self.fcnt_up.wrapping_add(1);
        frame
    }

    /// Draw a fresh OTAA DevNonce.
    pub fn draw_dev_nonce(&mut self, rng: &mut ChaCha8Rng) -> u16 {
        self.dev_nonce = rng.gen();
        self.dev_nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn node() -> Node {
        Node::new(
            NodeId(1),
            Position::new(0.0, 0.0),
            12,
            14.0,
            DeviceClass::A,
            lwsim_phy::energy::reference_profile(),
            None,
            0.0,
        )
    }

    #[test]
    fn poisson_clock_is_monotone_and_mean_is_right() {
        let mut n = node();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut last = 0.0;
        let count = 4000;
        for _ in 0..count {
            let t = n.next_poisson_arrival_s(100.0, &mut rng);
            assert!(t > last);
            last = t;
        }
        let mean = last / count as f64;
        assert!((mean - 100.0).abs() < 5.0, "empirical mean {mean}");
    }

    #[test]
    fn battery_depletion_stops_the_node() {
        let mut n = node();
        n.battery_capacity_j = Some(1.0);
        n.battery_remaining_j = 1.0;
        n.add_energy(RadioState::Tx, 0.6);
        assert!(n.alive);
        n.add_energy(RadioState::Tx, 0.6);
        assert!(!n.alive);
        assert_eq!(n.battery_remaining_j, 0.0);
        // Dead nodes accumulate nothing further.
        let consumed = n.energy_consumed_j;
        n.add_energy(RadioState::Tx, 1.0);
        assert_eq!(n.energy_consumed_j, consumed);
    }

    #[test]
    fn consume_until_integrates_the_held_state() {
        let mut n = node();
        n.state = RadioState::Rx;
        n.state_since = SimTime::ZERO;
        n.consume_until(SimTime::from_secs(2.0));
        let expected = 3.3 * 11e-3 * 2.0;
        assert!((n.energy_consumed_j - expected).abs() < 1e-12);
        // Second call with no elapsed time adds nothing.
        n.consume_until(SimTime::from_secs(2.0));
        assert!((n.energy_consumed_j - expected).abs() < 1e-12);
    }

    #[test]
    fn adr_ack_req_raises_after_limit() {
        let mut n = node();
        n.adr_enabled = true;
        for _ in 0..ADR_ACK_LIMIT {
            n.adr_uplink_bookkeeping(Region::Eu868);
        }
        assert!(n.adr_ack_req);
        assert_eq!(n.tx_power_dbm, 14.0);
    }

    #[test]
    fn adr_fallback_escalates_power_then_sf() {
        let mut n = node();
        n.adr_enabled = true;
        n.sf = 10;
        n.tx_power_dbm = 2.0;
        for _ in 0..(ADR_ACK_LIMIT + ADR_ACK_DELAY) {
            n.adr_uplink_bookkeeping(Region::Eu868);
        }
        // First escalation restores maximum power.
        assert_eq!(n.tx_power_dbm, 14.0);
        assert_eq!(n.sf, 10);
        for _ in 0..ADR_ACK_DELAY {
            n.adr_uplink_bookkeeping(Region::Eu868);
        }
        // Next escalation raises the spreading factor.
        assert_eq!(n.sf, 11);
    }

    #[test]
    fn downlink_resets_adr_backoff_and_applies_link_adr() {
        let mut n = node();
        n.adr_enabled = true;
        n.adr_ack_cnt = 70;
        n.adr_ack_req = true;
        n.downlink_pending = 1;

        let req = LinkAdrReq {
            data_rate: 5,
            tx_power_index: 2,
            ch_mask: 0x0003,
            nb_trans: 2,
        };
        let frame = DownlinkFrame::Data(DataFrame::downlink(0, req.to_bytes(), false));
        n.handle_downlink(&frame, Region::Eu868);

        assert_eq!(n.adr_ack_cnt, 0);
        assert!(!n.adr_ack_req);
        assert_eq!(n.sf, 7);
        assert_eq!(n.tx_power_dbm, 8.0);
        assert_eq!(n.channel_mask, 0x0003);
        assert_eq!(n.nb_trans, 2);
        assert_eq!(n.downlink_pending, 0);
    }

    #[test]
    fn uplink_frames_count_up() {
        let mut n = node();
        let a = n.build_uplink(20);
        let b = n.build_uplink(20);
        assert_eq!(a.fcnt, 0);
        assert_eq!(b.fcnt, 1);
        assert_eq!(a.wire_size(), 33);
    }

    #[test]
    fn adr_ack_req_bit_is_set_on_the_frame() {
        let mut n = node();
        n.adr_ack_req = true;
        let f = n.build_uplink(10);
        assert!(f.adr_ack_req());
    }

    #[test]
    fn beacon_loss_is_counted() {
        let mut n = node();
        n.observe_beacon(SimTime::from_secs(128.0), false);
        assert_eq!(n.last_beacon, Some(SimTime::from_secs(128.0)));
        n.observe_beacon(SimTime::from_secs(256.0), true);
        assert_eq!(n.missed_beacons, 1);
        assert_eq!(n.last_beacon, Some(SimTime::from_secs(128.0)));
    }
}
