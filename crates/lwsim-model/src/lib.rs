//! # lwsim-model
//!
//! Scenario configuration for lwsim.
//!
//! This crate provides:
//! - The YAML scenario schema ([`Scenario`]) with validation
//! - Environment and long-range presets ([`presets`])
//! - A loader for reference-simulator `.ini` scenario descriptions
//!   ([`ini`])
//!
//! Configuration errors are fatal at startup: a scenario either loads
//! and validates completely, or the run does not start.

pub mod ini;
pub mod presets;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lwsim_mac::region::Region;
use lwsim_phy::pathloss::PathLossModel;
use lwsim_phy::per::PerModel;
use lwsim_phy::LinkGains;

/// Errors raised while loading or validating a scenario.
#[derive(Debug, Error)]
pub enum ModelError {
    /// YAML parsing error.
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed reference INI scenario.
    #[error("invalid ini scenario: {0}")]
    InvalidIni(String),
}

// ============================================================================
// Scenario Schema
// ============================================================================

/// Device class shared by all nodes of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceClass {
    #[default]
    A,
    B,
    C,
}

/// How channels from the plan are assigned to nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelDistribution {
    #[default]
    RoundRobin,
    Random,
}

/// SNR aggregation method used by server-side ADR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdrMethod {
    Avg,
    #[default]
    Max,
}

/// Traffic model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TrafficModel {
    /// Poisson arrivals with exponential inter-arrival times.
    Random { mean_interval_s: f64 },
    /// Fixed-period arrivals.
    Periodic { period_s: f64 },
}

impl Default for TrafficModel {
    fn default() -> Self {
        TrafficModel::Random {
            mean_interval_s: ini::DEFAULT_MEAN_INTERVAL_S,
        }
    }
}

impl TrafficModel {
    /// Mean time between transmissions, seconds.
    pub fn mean_interval_s(&self) -> f64 {
        match self {
            TrafficModel::Random { mean_interval_s } => *mean_interval_s,
            TrafficModel::Periodic { period_s } => *period_s,
        }
    }
}

/// One channel of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub frequency_hz: u32,
    #[serde(default = "default_bandwidth")]
    pub bandwidth_hz: u32,
}

fn default_bandwidth() -> u32 {
    125_000
}

/// Explicit node placement (otherwise positions are drawn uniformly).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodePlacement {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub sf: Option<u8>,
    #[serde(default)]
    pub tx_power_dbm: Option<f64>,
}

/// Explicit gateway placement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GatewayPlacement {
    pub x: f64,
    pub y: f64,
}

/// Mobility settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MobilityConfig {
    pub enabled: bool,
    pub min_speed_mps: f64,
    pub max_speed_mps: f64,
    /// Interval between mobility steps, seconds.
    pub step_s: f64,
}

impl Default for MobilityConfig {
    fn default() -> Self {
        MobilityConfig {
            enabled: false,
            min_speed_mps: 2.0,
            max_speed_mps: 10.0,
            step_s: 60.0,
        }
    }
}

/// Class-B settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassBConfig {
    pub beacon_interval_s: f64,
    pub ping_slot_interval_s: f64,
    pub ping_slot_offset_s: f64,
    pub beacon_loss_prob: f64,
    /// Relative beacon drift applied network-wide.
    pub beacon_drift: f64,
    /// Standard deviation of the per-node clock offset, seconds.
    pub clock_accuracy_s: f64,
}

impl Default for ClassBConfig {
    fn default() -> Self {
        ClassBConfig {
            beacon_interval_s: lwsim_mac::timing::DEFAULT_BEACON_INTERVAL_S,
            ping_slot_interval_s: lwsim_mac::timing::DEFAULT_PING_SLOT_INTERVAL_S,
            ping_slot_offset_s: lwsim_mac::timing::DEFAULT_PING_SLOT_OFFSET_S,
            beacon_loss_prob: 0.0,
            beacon_drift: 0.0,
            clock_accuracy_s: 0.0,
        }
    }
}

/// Server timing model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerTiming {
    /// Gateway → server network latency, seconds.
    pub network_delay_s: f64,
    /// Server processing delay, seconds.
    pub process_delay_s: f64,
    /// RX1 delay after the uplink end, seconds.
    pub rx_delay_s: f64,
}

impl Default for ServerTiming {
    fn default() -> Self {
        ServerTiming {
            network_delay_s: 0.01,
            process_delay_s: 1.2,
            rx_delay_s: lwsim_mac::timing::DEFAULT_RX_DELAY_S,
        }
    }
}

/// A complete scenario description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Scenario {
    pub num_nodes: usize,
    pub num_gateways: usize,
    /// Side of the square deployment area, metres.
    pub area_size_m: f64,
    /// Explicit placements override the random layout.
    pub nodes: Vec<NodePlacement>,
    pub gateways: Vec<GatewayPlacement>,

    pub region: Region,
    /// Channel plan; empty means the region's default channels.
    pub channels: Vec<ChannelConfig>,
    pub channel_distribution: ChannelDistribution,

    pub traffic: TrafficModel,
    /// Mean interval of the very first packet only.
    pub first_packet_interval_s: Option<f64>,
    /// Packets each node sends before going quiet (0 = unlimited).
    pub packets_per_node: u32,
    pub max_sim_time_s: Option<f64>,

    pub node_class: DeviceClass,
    pub adr_node: bool,
    pub adr_server: bool,
    pub adr_method: AdrMethod,
    pub duty_cycle: Option<f64>,

    pub mobility: MobilityConfig,
    pub class_b: ClassBConfig,
    pub class_c_rx_interval_s: f64,
    pub timing: ServerTiming,

    pub payload_size_bytes: usize,
    pub fixed_sf: Option<u8>,
    pub fixed_tx_power_dbm: Option<f64>,
    pub battery_capacity_j: Option<f64>,
    pub energy_profile: String,

    pub path_loss: PathLossModel,
    pub per_model: PerModel,
    /// Calibrate thresholds and timings against the reference simulator.
    pub reference_mode: bool,
    pub link_gains: LinkGains,
    /// Carrier-sense floor applied before the sensitivity check.
    /// Disabled by default; the reference's −90 dBm carrier-sense value
    /// is available as `lwsim_phy::ENERGY_DETECTION_DBM`.
    pub energy_detection_dbm: f64,
    /// Extra margin added to the sensitivity threshold, dB.
    pub sensitivity_margin_db: f64,
    pub enable_security: bool,

    pub seed: u64,
}

impl Default for Scenario {
    fn default() -> Self {
        Scenario {
            num_nodes: 10,
            num_gateways: 1,
            area_size_m: 1000.0,
            nodes: Vec::new(),
            gateways: Vec::new(),
            region: Region::default(),
            channels: Vec::new(),
            channel_distribution: ChannelDistribution::default(),
            traffic: TrafficModel::default(),
            first_packet_interval_s: None,
            packets_per_node: 0,
            max_sim_time_s: None,
            node_class: DeviceClass::default(),
            adr_node: false,
            adr_server: false,
            adr_method: AdrMethod::default(),
            duty_cycle: Region::default().default_duty_cycle(),
            mobility: MobilityConfig::default(),
            class_b: ClassBConfig::default(),
            class_c_rx_interval_s: 1.0,
            timing: ServerTiming::default(),
            payload_size_bytes: 20,
            fixed_sf: None,
            fixed_tx_power_dbm: None,
            battery_capacity_j: None,
            energy_profile: "flora".to_string(),
            path_loss: PathLossModel::default(),
            per_model: PerModel::default(),
            reference_mode: false,
            link_gains: LinkGains::default(),
            energy_detection_dbm: f64::NEG_INFINITY,
            sensitivity_margin_db: 0.0,
            enable_security: false,
            seed: 0,
        }
    }
}

impl Scenario {
    /// Load a scenario from a YAML file and validate it.
    pub fn load(path: &Path) -> Result<Scenario, ModelError> {
        let text = std::fs::read_to_string(path)?;
        Scenario::from_yaml(&text)
    }

    /// Parse a scenario from YAML text and validate it.
    pub fn from_yaml(text: &str) -> Result<Scenario, ModelError> {
        let scenario: Scenario = serde_yaml::from_str(text)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Effective channel plan: the configured one, or the region default.
    pub fn channel_plan(&self) -> Vec<ChannelConfig> {
        if !self.channels.is_empty() {
            return self.channels.clone();
        }
        self.region
            .default_channels_hz()
            .iter()
            .map(|&frequency_hz| ChannelConfig {
                frequency_hz,
                bandwidth_hz: self.region.default_bandwidth_hz(),
            })
            .collect()
    }

    /// Reject inconsistent configurations before the engine starts.
    pub fn validate(&self) -> Result<(), ModelError> {
        let fail = |msg: String| Err(ModelError::InvalidConfig(msg));

        if self.num_nodes == 0 && self.nodes.is_empty() {
            return fail("scenario declares no nodes".into());
        }
        if self.num_gateways == 0 && self.gateways.is_empty() {
            return fail("scenario declares no gateways".into());
        }
        if self.area_size_m <= 0.0 {
            return fail(format!("area_size_m must be positive, got {}", self.area_size_m));
        }
        if self.traffic.mean_interval_s() <= 0.0 {
            return fail("traffic interval must be positive".into());
        }
        if let Some(first) = self.first_packet_interval_s {
            if first <= 0.0 {
                return fail("first_packet_interval_s must be positive".into());
            }
        }
        if let Some(duty) = self.duty_cycle {
            if !(0.0 < duty && duty <= 1.0) {
                return fail(format!("duty_cycle must be in (0, 1], got {duty}"));
            }
        }
        if let Some(sf) = self.fixed_sf {
            if !(7..=12).contains(&sf) {
                return fail(format!("fixed_sf must be 7..=12, got {sf}"));
            }
        }
        if self.payload_size_bytes == 0 {
            return fail("payload_size_bytes must be positive".into());
        }

        let plan = self.channel_plan();
        if plan.is_empty() {
            return fail("channel plan is empty".into());
        }
        let mut seen = std::collections::HashSet::new();
        for ch in &plan {
            if ch.frequency_hz == 0 {
                return fail("channel frequency must be positive".into());
            }
            if !matches!(ch.bandwidth_hz, 125_000 | 250_000 | 500_000) {
                return fail(format!(
                    "unsupported bandwidth {} Hz (expected 125/250/500 kHz)",
                    ch.bandwidth_hz
                ));
            }
            if !seen.insert((ch.frequency_hz, ch.bandwidth_hz)) {
                return fail(format!(
                    "duplicate channel {} Hz / {} Hz in plan",
                    ch.frequency_hz, ch.bandwidth_hz
                ));
            }
            // A plan wildly outside the regional band is a region mixup.
            let anchor = self.region.default_channels_hz()[0] as i64;
            if (ch.frequency_hz as i64 - anchor).abs() > 40_000_000 {
                return fail(format!(
                    "channel {} Hz is inconsistent with region {:?}",
                    ch.frequency_hz, self.region
                ));
            }
        }

        if self.class_b.beacon_interval_s <= 0.0 || self.class_b.ping_slot_interval_s <= 0.0 {
            return fail("class B intervals must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.class_b.beacon_loss_prob) {
            return fail("beacon_loss_prob must be within [0, 1]".into());
        }
        if self.class_c_rx_interval_s <= 0.0 {
            return fail("class_c_rx_interval_s must be positive".into());
        }
        lwsim_phy::energy::profile_by_name(&self.energy_profile)
            .map_err(|e| ModelError::InvalidConfig(e.to_string()))?;
        Ok(())
    }
}
