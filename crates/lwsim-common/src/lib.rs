//! # lwsim-common
//!
//! Common types and primitives for the lwsim LoRaWAN simulator.
//!
//! This crate provides:
//! - Time representation ([`SimTime`], integer nanoseconds)
//! - Entity identification ([`NodeId`], [`GatewayId`], [`PacketId`])
//! - Positions in the deployment area ([`Position`])
//! - The simulation event vocabulary ([`EventKind`])
//! - A deterministic, cancellable event queue ([`EventQueue`])
//! - Purpose-split deterministic RNG streams ([`RngStreams`])

pub mod queue;
pub mod rng;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use queue::{EventHandle, EventQueue, ScheduledEvent};
pub use rng::RngStreams;

// ============================================================================
// Error Types
// ============================================================================

/// Simulation errors.
///
/// Configuration and domain errors are fatal and propagate out of the
/// engine; everything softer (reception failures, scheduling misses,
/// exhausted batteries) is reported through event outcomes and metrics
/// instead of this enum.
#[derive(Debug, Error)]
pub enum SimError {
    /// Invalid configuration detected at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Out-of-domain argument at point of use.
    #[error("domain error: {0}")]
    Domain(String),

    /// Reference to a node that does not exist.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// Reference to a gateway that does not exist.
    #[error("unknown gateway: {0}")]
    UnknownGateway(GatewayId),

    /// Simulation time overflow.
    #[error("simulation time overflow")]
    TimeOverflow,
}

// ============================================================================
// Time
// ============================================================================

/// Simulation time in integer nanoseconds since simulation start.
///
/// Airtime is converted to nanoseconds exactly once (at TX start) and the
/// resulting duration is reused for the matching TX end, so packet end
/// times never drift from `start + airtime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// Create from nanoseconds.
    pub const fn from_nanos(ns: u64) -> Self {
        SimTime(ns)
    }

    /// Create from microseconds.
    pub const fn from_micros(us: u64) -> Self {
        SimTime(us * 1_000)
    }

    /// Create from milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1_000_000)
    }

    /// Create from seconds (float), rounding to the nearest nanosecond.
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * 1e9).round() as u64)
    }

    /// Get as nanoseconds.
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Get as milliseconds (truncating).
    pub const fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Checked addition.
    pub fn checked_add(&self, duration: SimTime) -> Option<SimTime> {
        self.0.checked_add(duration.0).map(SimTime)
    }

    /// Saturating subtraction.
    pub fn saturating_sub(&self, duration: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(duration.0))
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0 + rhs.0)
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

// ============================================================================
// Identities
// ============================================================================

/// Unique identifier of an end-device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Unique identifier of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GatewayId(pub u32);

impl std::fmt::Display for GatewayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gw{}", self.0)
    }
}

/// Unique identifier of an uplink transmission attempt.
///
/// Allocated monotonically by the engine; one `PacketId` covers the whole
/// TX_START → TX_END → server-processing lifetime of a frame, including
/// its copies received by several gateways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PacketId(pub u64);

// ============================================================================
// Positions
// ============================================================================

/// Cartesian position in the deployment area, metres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Position {
    /// Create a position at ground level.
    pub fn new(x: f64, y: f64) -> Self {
        Position { x, y, z: 0.0 }
    }

    /// Euclidean distance to another position, metres.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

// ============================================================================
// Events
// ============================================================================

/// Class-A receive window selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RxWindow {
    Rx1,
    Rx2,
}

/// The kinds of events the engine dispatches.
///
/// Events carry indices, never references: the simulator owns the dense
/// node/gateway vectors and resolves ids at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A node starts transmitting an uplink.
    TxStart { node: NodeId },
    /// The uplink identified by `packet` leaves the air.
    TxEnd { node: NodeId, packet: PacketId },
    /// A class-A receive window opens.
    RxWindowOpen { node: NodeId, window: RxWindow },
    /// A class-A receive window closes.
    RxWindowClose { node: NodeId, window: RxWindow },
    /// Network-wide class-B beacon.
    Beacon,
    /// Class-B ping slot for one node.
    PingSlot { node: NodeId },
    /// Recurring class-C downlink poll.
    ClassCPoll { node: NodeId },
    /// A sleeping node wakes up (mobility step, deferred TX).
    NodeWake { node: NodeId },
    /// A gateway starts emitting a downlink towards `node`.
    DownlinkStart { node: NodeId, gateway: GatewayId },
    /// The downlink towards `node` leaves the air.
    DownlinkEnd { node: NodeId, gateway: GatewayId },
    /// An uplink copy reaches the network server (network latency elapsed).
    ServerRx { packet: PacketId },
    /// The server finishes processing an uplink copy.
    ServerProcess { packet: PacketId },
    /// Mobility step for one node.
    Mobility { node: NodeId },
}

impl EventKind {
    /// The node this event concerns, if any.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            EventKind::TxStart { node }
            | EventKind::TxEnd { node, .. }
            | EventKind::RxWindowOpen { node, .. }
            | EventKind::RxWindowClose { node, .. }
            | EventKind::PingSlot { node }
            | EventKind::ClassCPoll { node }
            | EventKind::NodeWake { node }
            | EventKind::DownlinkStart { node, .. }
            | EventKind::DownlinkEnd { node, .. }
            | EventKind::Mobility { node } => Some(*node),
            EventKind::Beacon | EventKind::ServerRx { .. } | EventKind::ServerProcess { .. } => {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_time_conversions() {
        let t = SimTime::from_secs(1.5);
        assert_eq!(t.as_millis(), 1500);
        assert_eq!(t.as_nanos(), 1_500_000_000);
        assert!((t.as_secs_f64() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn sim_time_arithmetic() {
        let a = SimTime::from_millis(100);
        let b = SimTime::from_millis(40);
        assert_eq!((a + b).as_millis(), 140);
        assert_eq!((a - b).as_millis(), 60);
        assert_eq!((b - a), SimTime::ZERO);
        assert_eq!(b.saturating_sub(a), SimTime::ZERO);
        assert_eq!(a.checked_add(b), Some(SimTime::from_millis(140)));
        assert_eq!(SimTime::from_nanos(u64::MAX).checked_add(b), None);
    }

    #[test]
    fn sim_time_round_trips_airtime_exactly() {
        // Airtime converted once must reproduce end - start bit-exactly.
        let airtime = SimTime::from_secs(0.061_696);
        let start = SimTime::from_secs(1234.567_891);
        let end = start + airtime;
        assert_eq!(end - start, airtime);
    }

    #[test]
    fn position_distance() {
        let a = Position::new(0.0, 0.0);
        let b = Position { x: 3.0, y: 4.0, z: 0.0 };
        assert!((a.distance_to(&b) - 5.0).abs() < 1e-12);
    }
}
