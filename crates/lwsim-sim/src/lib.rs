//! # lwsim-sim
//!
//! The lwsim discrete-event engine.
//!
//! This crate binds the PHY and MAC layers into a runnable simulation:
//! - [`node::Node`]: per-device state machine, Poisson arrivals, ADR
//!   client, battery accounting
//! - [`gateway::Gateway`]: concurrent reception slots, capture
//!   decisions, per-packet SNIR accounting, downlink buffering
//! - [`server::NetworkServer`]: deduplication, per-gateway SNIR
//!   history, ADR decisions, downlink scheduling
//! - [`downlink::DownlinkScheduler`]: class A/B/C downlink placement
//!   with gateway occupancy
//! - [`duty_cycle::DutyCycleManager`]: per-band duty-cycle enforcement
//! - [`mobility::SmoothMobility`]: waypoint mobility
//! - [`simulator::Simulator`]: the event loop and metrics
//!
//! One simulation run is strictly single-threaded; separate runs are
//! independent and may execute in parallel.

pub mod downlink;
pub mod duty_cycle;
pub mod gateway;
pub mod metrics_defs;
pub mod mobility;
pub mod node;
pub mod server;
pub mod simulator;

use serde::Serialize;

use lwsim_common::{GatewayId, NodeId, PacketId, SimTime};

/// One uplink on the air: everything the gateways and the server need to
/// account for it. Airtime is computed once, at TX start, and carried
/// here for the rest of the packet's life.
#[derive(Debug, Clone)]
pub struct UplinkTransmission {
    pub packet: PacketId,
    pub node: NodeId,
    pub spreading_factor: u8,
    pub frequency_hz: u32,
    pub bandwidth_hz: u32,
    pub payload_bytes: usize,
    pub fcnt: u32,
    pub frame_digest: u64,
    /// The frame carried the ADRACKReq bit.
    pub adr_ack_req: bool,
    pub start: SimTime,
    pub end: SimTime,
    pub airtime_s: f64,
}

/// Why a gateway did not deliver a reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReason {
    /// RSSI under the energy-detection threshold.
    BelowEnergyDetection,
    /// RSSI under the sensitivity threshold.
    BelowSensitivity,
    /// Lost the capture contest against a co-channel transmission.
    Capture,
    /// Failed the packet-error-rate draw.
    PacketError,
}

/// Outcome of a completed reception at one gateway.
#[derive(Debug, Clone, Copy)]
pub struct Reception {
    pub gateway: GatewayId,
    pub rssi_dbm: f64,
    pub snir_db: f64,
    pub spreading_factor: u8,
    pub frequency_hz: u32,
    pub success: bool,
    pub reason: Option<LossReason>,
}

/// Terminal result of one uplink attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UplinkResult {
    Delivered,
    CollisionLoss,
    NoCoverage,
}

/// Per-uplink log record, kept for trace export and loss attribution.
#[derive(Debug, Clone, Serialize)]
pub struct UplinkRecord {
    pub packet: PacketId,
    pub node: NodeId,
    pub sf: u8,
    pub frequency_hz: u32,
    pub start_s: f64,
    pub end_s: f64,
    /// At least one gateway allocated a reception slot.
    pub heard: bool,
    pub result: Option<UplinkResult>,
    pub gateway: Option<GatewayId>,
    pub rssi_dbm: Option<f64>,
    pub snr_db: Option<f64>,
    pub energy_j: f64,
}
