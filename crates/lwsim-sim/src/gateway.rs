//! Gateway reception state machine.
//!
//! A gateway tracks one reception slot per concurrent transmission. A
//! slot is held until the transmission's end even when the packet is
//! already lost, because the signal keeps occupying the channel and
//! interfering. Interference is accumulated pairwise at arrival time,
//! strictly between slots sharing the exact same (frequency, bandwidth):
//! signals on distinct carriers or bandwidths never contribute to each
//! other's noise.

use std::collections::HashMap;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use lwsim_common::{GatewayId, NodeId, PacketId, Position, SimTime};
use lwsim_mac::frames::DownlinkFrame;
use lwsim_phy::capture::{capture_threshold_db, capture_window_begin};
use lwsim_phy::energy::{EnergyAccumulator, EnergyComponent, EnergyProfile};
use lwsim_phy::per::PerModel;
use lwsim_phy::{dbm_to_mw, mw_to_dbm, DEFAULT_PREAMBLE_SYMBOLS};

use crate::{LossReason, Reception, UplinkTransmission};

/// One tracked reception.
#[derive(Debug, Clone)]
struct ReceptionSlot {
    packet: PacketId,
    node: NodeId,
    spreading_factor: u8,
    frequency_hz: u32,
    bandwidth_hz: u32,
    start: SimTime,
    end: SimTime,
    rssi_dbm: f64,
    /// Noise sample taken with the RSSI and reused for every later
    /// decision about this packet.
    noise_dbm: f64,
    /// Energy of co-channel interferers over this slot, mW·s.
    interference_mw_s: f64,
    lost: Option<LossReason>,
}

/// A downlink waiting in the gateway's buffer for a node to listen.
#[derive(Debug, Clone)]
pub struct BufferedDownlink {
    pub frame: DownlinkFrame,
    pub data_rate: Option<u8>,
    pub tx_power_dbm: Option<f64>,
}

/// A LoRaWAN gateway.
#[derive(Debug)]
pub struct Gateway {
    pub id: GatewayId,
    pub position: Position,
    pub energy_detection_dbm: f64,
    /// Extra margin on top of the sensitivity table, dB.
    pub sensitivity_margin_db: f64,
    pub downlink_power_dbm: f64,
    slots: Vec<ReceptionSlot>,
    downlinks: HashMap<NodeId, Vec<BufferedDownlink>>,
    pub energy: EnergyAccumulator,
    pub profile: EnergyProfile,
}

impl Gateway {
    pub fn new(id: GatewayId, position: Position, energy_detection_dbm: f64) -> Self {
        Gateway {
            id,
            position,
            energy_detection_dbm,
            sensitivity_margin_db: 0.0,
            downlink_power_dbm: 14.0,
            slots: Vec::new(),
            downlinks: HashMap::new(),
            energy: EnergyAccumulator::default(),
            profile: lwsim_phy::energy::reference_profile(),
        }
    }

    /// Number of live reception slots (for tests and occupancy metrics).
    pub fn active_receptions(&self) -> usize {
        self.slots.len()
    }

    /// Begin tracking an uplink arriving with `rssi_dbm`.
    ///
    /// Returns `Err(reason)` when the signal is rejected outright (below
    /// energy detection or sensitivity); such signals never get a slot.
    /// An accepted signal gets a slot, exchanges interference with every
    /// live co-channel slot, and fights the capture contest; it may
    /// already be marked lost on return, but the slot stays until the
    /// transmission ends.
    pub fn start_reception(
        &mut self,
        tx: &UplinkTransmission,
        rssi_dbm: f64,
        noise_dbm: f64,
    ) -> Result<(), LossReason> {
        self.prune_ended(tx.start);

        if rssi_dbm < self.energy_detection_dbm {
            return Err(LossReason::BelowEnergyDetection);
        }
        let threshold = lwsim_phy::sensitivity(tx.spreading_factor, tx.bandwidth_hz)
            + self.sensitivity_margin_db;
        if rssi_dbm < threshold {
            return Err(LossReason::BelowSensitivity);
        }

        let mut slot = ReceptionSlot {
            packet: tx.packet,
            node: tx.node,
            spreading_factor: tx.spreading_factor,
            frequency_hz: tx.frequency_hz,
            bandwidth_hz: tx.bandwidth_hz,
            start: tx.start,
            end: tx.end,
            rssi_dbm,
            noise_dbm,
            interference_mw_s: 0.0,
            lost: None,
        };

        let new_mw = dbm_to_mw(rssi_dbm);
        for other in &mut self.slots {
            if other.frequency_hz != slot.frequency_hz || other.bandwidth_hz != slot.bandwidth_hz {
                continue;
            }
            let overlap_s = overlap_seconds(&slot, other);
            if overlap_s <= 0.0 {
                continue;
            }
            other.interference_mw_s += new_mw * overlap_s;
            slot.interference_mw_s += dbm_to_mw(other.rssi_dbm) * overlap_s;

            // Symmetric capture contest. A contender is only defeated
            // when the interference still overlaps its open capture
            // window.
            let other_defeats_new = !captures_over(&slot, other) && interferes_in_window(&slot, other);
            let new_defeats_other = !captures_over(other, &slot) && interferes_in_window(other, &slot);
            if other_defeats_new && slot.lost.is_none() {
                slot.lost = Some(LossReason::Capture);
            }
            if new_defeats_other && other.lost.is_none() {
                debug!(gateway = %self.id, packet = ?other.packet, "reception lost to a stronger arrival");
                other.lost = Some(LossReason::Capture);
            }
        }

        self.slots.push(slot);
        Ok(())
    }

    /// Complete the reception of `packet` at `now` (its end time).
    ///
    /// Returns the reception outcome, applying the packet-error draw to
    /// survivors. `None` when the gateway never tracked the packet.
    pub fn end_reception(
        &mut self,
        packet: PacketId,
        per_model: PerModel,
        payload_bytes: usize,
        rng: &mut ChaCha8Rng,
    ) -> Option<Reception> {
        let idx = self.slots.iter().position(|s| s.packet == packet)?;
        let slot = self.slots.remove(idx);

        let snir_db = compute_snir(&slot);
        let mut reason = slot.lost;
        if reason.is_none() {
            let per = per_model.per(snir_db, slot.spreading_factor, payload_bytes);
            let draw: f64 = rng.gen();
            if per >= 1.0 || draw < per {
                reason = Some(LossReason::PacketError);
            }
        }

        Some(Reception {
            gateway: self.id,
            rssi_dbm: slot.rssi_dbm,
            snir_db,
            spreading_factor: slot.spreading_factor,
            frequency_hz: slot.frequency_hz,
            success: reason.is_none(),
            reason,
        })
    }

    /// Queue a downlink for `node`.
    pub fn buffer_downlink(
        &mut self,
        node: NodeId,
        frame: DownlinkFrame,
        data_rate: Option<u8>,
        tx_power_dbm: Option<f64>,
    ) {
        self.downlinks.entry(node).or_default().push(BufferedDownlink {
            frame,
            data_rate,
            tx_power_dbm,
        });
    }

    /// Pop the oldest buffered downlink for `node`.
    pub fn pop_downlink(&mut self, node: NodeId) -> Option<BufferedDownlink> {
        let queue = self.downlinks.get_mut(&node)?;
        if queue.is_empty() {
            return None;
        }
        let item = queue.remove(0);
        if queue.is_empty() {
            self.downlinks.remove(&node);
        }
        Some(item)
    }

    /// Whether any downlink is waiting for `node`.
    pub fn has_downlink(&self, node: NodeId) -> bool {
        self.downlinks.get(&node).map_or(false, |q| !q.is_empty())
    }

    /// Bill the energy of an emitted downlink.
    pub fn account_downlink_energy(&mut self, airtime_s: f64, tx_power_dbm: f64) {
        let current = self.profile.tx_current(tx_power_dbm);
        let volts = self.profile.voltage_v;
        self.energy.add(EnergyComponent::Tx, current * volts * airtime_s);
        let ramp_s = self.profile.ramp_up_s + self.profile.ramp_down_s;
        if ramp_s > 0.0 {
            self.energy.add(EnergyComponent::Ramp, current * volts * ramp_s);
        }
        if self.profile.preamble_time_s > 0.0 {
            self.energy.add(
                EnergyComponent::Preamble,
                self.profile.preamble_current_a * volts * self.profile.preamble_time_s,
            );
        }
    }

    fn prune_ended(&mut self, now: SimTime) {
        // A slot ending exactly now is kept: its own TX_END has not been
        // dispatched yet and still needs the slot.
        self.slots.retain(|s| s.end >= now);
    }
}

/// Overlap between two slots, seconds.
fn overlap_seconds(a: &ReceptionSlot, b: &ReceptionSlot) -> f64 {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    if end > start {
        (end - start).as_secs_f64()
    } else {
        0.0
    }
}

/// Whether `signal` holds the capture threshold over `interferer`.
fn captures_over(signal: &ReceptionSlot, interferer: &ReceptionSlot) -> bool {
    signal.rssi_dbm - interferer.rssi_dbm
        >= capture_threshold_db(signal.spreading_factor, interferer.spreading_factor)
}

/// Whether `interferer` still overlaps `signal` once its capture window
/// is open. Interference confined to the first
/// `preamble − capture window` symbols never defeats the signal.
fn interferes_in_window(signal: &ReceptionSlot, interferer: &ReceptionSlot) -> bool {
    let cs_begin = capture_window_begin(
        signal.start.as_secs_f64(),
        signal.spreading_factor,
        signal.bandwidth_hz,
        DEFAULT_PREAMBLE_SYMBOLS,
    );
    interferer.end.as_secs_f64() > cs_begin
}

/// SNIR of a slot from its accumulated co-channel interference, dB.
fn compute_snir(slot: &ReceptionSlot) -> f64 {
    let duration_s = (slot.end - slot.start).as_secs_f64().max(1e-9);
    let avg_interference_mw = slot.interference_mw_s / duration_s;
    let noise_mw = dbm_to_mw(slot.noise_dbm);
    mw_to_dbm(dbm_to_mw(slot.rssi_dbm) / (noise_mw + avg_interference_mw))
}
