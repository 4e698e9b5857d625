//! Environment and long-range presets.
//!
//! A preset bundles a path-loss calibration with the link budget that
//! makes it realistic. The long-range presets reproduce the reference's
//! kilometre-scale validation deployment: nine nodes on the x axis at
//! fixed distances, SF9..SF12, cycling through the three bandwidths.

use serde::{Deserialize, Serialize};

use crate::{ChannelConfig, ModelError, NodePlacement, Scenario, TrafficModel};
use lwsim_phy::pathloss::PathLossModel;
use lwsim_phy::LinkGains;

/// Named environment presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Reference log-normal calibration.
    Flora,
    /// Reference calibration with the Hata-Okumura loss curve.
    FloraHata,
    /// Reference calibration with the Oulu loss curve.
    FloraOulu,
    /// Rural kilometre-scale deployment with modest antennas.
    RuralLongRange,
    /// Maximum-range deployment with high-gain antennas.
    VeryLongRange,
}

impl Environment {
    pub fn from_name(name: &str) -> Result<Environment, ModelError> {
        match name.to_ascii_lowercase().as_str() {
            "flora" => Ok(Environment::Flora),
            "flora_hata" => Ok(Environment::FloraHata),
            "flora_oulu" => Ok(Environment::FloraOulu),
            "rural_long_range" => Ok(Environment::RuralLongRange),
            "very_long_range" => Ok(Environment::VeryLongRange),
            other => Err(ModelError::InvalidConfig(format!(
                "unknown environment preset: {other}"
            ))),
        }
    }

    /// Path-loss model of the preset. Long-range presets disable
    /// shadowing so validation runs are deterministic.
    pub fn path_loss(&self) -> PathLossModel {
        match self {
            Environment::Flora => PathLossModel::reference_log_normal(),
            Environment::FloraHata => PathLossModel::reference_hata(),
            Environment::FloraOulu => PathLossModel::reference_oulu(),
            Environment::RuralLongRange | Environment::VeryLongRange => {
                PathLossModel::reference_log_normal().with_shadowing(0.0)
            }
        }
    }

    /// Link budget recommended for the preset.
    pub fn link_gains(&self) -> LinkGains {
        match self {
            Environment::Flora | Environment::FloraHata | Environment::FloraOulu => {
                LinkGains::default()
            }
            Environment::RuralLongRange => LinkGains {
                tx_antenna_gain_db: 6.0,
                rx_antenna_gain_db: 6.0,
                cable_loss_db: 0.5,
                obstacle_loss_db: 0.0,
            },
            Environment::VeryLongRange => LinkGains {
                tx_antenna_gain_db: 16.0,
                rx_antenna_gain_db: 16.0,
                cable_loss_db: 0.5,
                obstacle_loss_db: 0.0,
            },
        }
    }

    /// TX power recommended for the preset, dBm.
    pub fn tx_power_dbm(&self) -> f64 {
        match self {
            Environment::RuralLongRange => 16.0,
            Environment::VeryLongRange => 23.0,
            _ => 14.0,
        }
    }
}

/// Deployment area of the long-range scenario, metres.
pub const LONG_RANGE_AREA_SIZE_M: f64 = 24_000.0;

/// Node distances from the gateway along the x axis, metres.
pub const LONG_RANGE_DISTANCES_M: [f64; 9] = [
    11_000.0, 10_800.0, 10_000.0, 9_000.0, 8_000.0, 7_000.0, 6_000.0, 5_000.0, 4_000.0,
];

/// Spreading factors paired with [`LONG_RANGE_DISTANCES_M`].
pub const LONG_RANGE_SPREADING_FACTORS: [u8; 9] = [12, 12, 12, 11, 11, 10, 10, 9, 9];

/// Bandwidths cycled across the long-range channels, Hz.
pub const LONG_RANGE_BANDWIDTHS_HZ: [u32; 3] = [125_000, 250_000, 500_000];

/// Build the deterministic long-range validation scenario.
pub fn long_range_scenario(
    environment: Environment,
    seed: u64,
    packets_per_node: u32,
) -> Result<Scenario, ModelError> {
    if !matches!(
        environment,
        Environment::RuralLongRange | Environment::VeryLongRange
    ) {
        return Err(ModelError::InvalidConfig(format!(
            "{environment:?} is not a long-range preset"
        )));
    }

    let center = LONG_RANGE_AREA_SIZE_M / 2.0;
    let nodes = LONG_RANGE_DISTANCES_M
        .iter()
        .zip(LONG_RANGE_SPREADING_FACTORS)
        .map(|(&distance, sf)| NodePlacement {
            x: center + distance,
            y: center,
            sf: Some(sf),
            tx_power_dbm: Some(environment.tx_power_dbm()),
        })
        .collect();

    let channels = LONG_RANGE_BANDWIDTHS_HZ
        .iter()
        .enumerate()
        .map(|(i, &bandwidth_hz)| ChannelConfig {
            frequency_hz: 868_100_000 + (i as u32) * 200_000,
            bandwidth_hz,
        })
        .collect();

    let scenario = Scenario {
        num_nodes: LONG_RANGE_DISTANCES_M.len(),
        num_gateways: 1,
        area_size_m: LONG_RANGE_AREA_SIZE_M,
        nodes,
        gateways: vec![crate::GatewayPlacement { x: center, y: center }],
        channels,
        traffic: TrafficModel::Periodic { period_s: 1200.0 },
        packets_per_node,
        duty_cycle: None,
        payload_size_bytes: 20,
        path_loss: environment.path_loss(),
        link_gains: environment.link_gains(),
        reference_mode: true,
        seed,
        ..Scenario::default()
    };
    scenario.validate()?;
    Ok(scenario)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_names_resolve() {
        assert_eq!(Environment::from_name("flora").unwrap(), Environment::Flora);
        assert_eq!(
            Environment::from_name("RURAL_LONG_RANGE").unwrap(),
            Environment::RuralLongRange
        );
        assert!(Environment::from_name("mars").is_err());
    }

    #[test]
    fn long_range_scenario_is_deterministic_layout() {
        let s = long_range_scenario(Environment::VeryLongRange, 3, 8).unwrap();
        assert_eq!(s.nodes.len(), 9);
        assert_eq!(s.gateways.len(), 1);
        assert_eq!(s.nodes[0].sf, Some(12));
        assert_eq!(s.nodes[8].sf, Some(9));
        let gw = s.gateways[0];
        assert!((s.nodes[0].x - gw.x - 11_000.0).abs() < 1e-9);
        // Shadowing disabled for validation runs.
        assert_eq!(s.path_loss.shadowing_sigma_db(), 0.0);
    }

    #[test]
    fn long_range_requires_long_range_preset() {
        assert!(long_range_scenario(Environment::Flora, 1, 1).is_err());
    }

    #[test]
    fn very_long_range_has_high_gain_antennas() {
        let gains = Environment::VeryLongRange.link_gains();
        assert_eq!(gains.tx_antenna_gain_db, 16.0);
        assert_eq!(Environment::VeryLongRange.tx_power_dbm(), 23.0);
    }
}
