//! Region presets.
//!
//! Each region defines its default uplink channels, the DR ↔ SF mapping,
//! the RX2 parameters and the TX power ladder. ADR walks the ladder in
//! 3 dB steps, index 0 being the regional maximum.

use serde::{Deserialize, Serialize};

/// Supported regulatory regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    #[default]
    Eu868,
    Us915,
    Au915,
    As923,
    In865,
    Kr920,
}

/// RX2 window parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rx2Params {
    pub frequency_hz: u32,
    pub data_rate: u8,
}

impl Region {
    /// Default uplink channel frequencies, Hz.
    pub fn default_channels_hz(&self) -> &'static [u32] {
        match self {
            Region::Eu868 => &[868_100_000, 868_300_000, 868_500_000],
            Region::Us915 => &[
                902_300_000,
                902_500_000,
                902_700_000,
                902_900_000,
                903_100_000,
                903_300_000,
                903_500_000,
                903_700_000,
            ],
            Region::Au915 => &[
                915_200_000,
                915_400_000,
                915_600_000,
                915_800_000,
                916_000_000,
                916_200_000,
                916_400_000,
                916_600_000,
            ],
            Region::As923 => &[923_200_000, 923_400_000],
            Region::In865 => &[865_062_500, 865_402_500, 865_985_000],
            Region::Kr920 => &[922_100_000, 922_300_000, 922_500_000],
        }
    }

    /// Default uplink bandwidth, Hz.
    pub fn default_bandwidth_hz(&self) -> u32 {
        125_000
    }

    /// RX2 frequency and data rate.
    pub fn rx2(&self) -> Rx2Params {
        match self {
            Region::Eu868 => Rx2Params {
                frequency_hz: 869_525_000,
                data_rate: 0,
            },
            Region::Us915 => Rx2Params {
                frequency_hz: 923_300_000,
                data_rate: 8,
            },
            Region::Au915 => Rx2Params {
                frequency_hz: 923_300_000,
                data_rate: 8,
            },
            Region::As923 => Rx2Params {
                frequency_hz: 923_200_000,
                data_rate: 2,
            },
            Region::In865 => Rx2Params {
                frequency_hz: 866_550_000,
                data_rate: 2,
            },
            Region::Kr920 => Rx2Params {
                frequency_hz: 921_900_000,
                data_rate: 0,
            },
        }
    }

    /// Spreading factor for an uplink data rate.
    ///
    /// Unknown data rates fall back to SF7 (the fastest).
    pub fn dr_to_sf(&self, data_rate: u8) -> u8 {
        match self {
            Region::Us915 | Region::Au915 => match data_rate {
                0 => 10,
                1 => 9,
                2 => 8,
                3 => 7,
                // RX2 DR8 is SF12 on the downlink band.
                8 => 12,
                9 => 11,
                10 => 10,
                11 => 9,
                12 => 8,
                13 => 7,
                _ => 7,
            },
            _ => match data_rate {
                0 => 12,
                1 => 11,
                2 => 10,
                3 => 9,
                4 => 8,
                5 => 7,
                _ => 7,
            },
        }
    }

    /// Data rate for an uplink spreading factor.
    pub fn sf_to_dr(&self, spreading_factor: u8) -> u8 {
        match self {
            Region::Us915 | Region::Au915 => match spreading_factor {
                10 => 0,
                9 => 1,
                8 => 2,
                _ => 3,
            },
            _ => match spreading_factor.clamp(7, 12) {
                12 => 0,
                11 => 1,
                10 => 2,
                9 => 3,
                8 => 4,
                _ => 5,
            },
        }
    }

    /// TX power ladder in dBm; index 0 is the regional maximum, each step
    /// down is 3 dB.
    pub fn tx_power_ladder_dbm(&self) -> &'static [f64] {
        match self {
            Region::Us915 | Region::Au915 => &[20.0, 17.0, 14.0, 11.0, 8.0, 5.0, 2.0],
            _ => &[14.0, 11.0, 8.0, 5.0, 2.0],
        }
    }

    /// Ladder index of the closest power, used when a scenario starts
    /// nodes at an off-ladder power.
    pub fn power_index(&self, power_dbm: f64) -> usize {
        let ladder = self.tx_power_ladder_dbm();
        let mut best = 0;
        for (i, p) in ladder.iter().enumerate() {
            if (p - power_dbm).abs() < (ladder[best] - power_dbm).abs() {
                best = i;
            }
        }
        best
    }

    /// Maximum TX power, dBm.
    pub fn max_power_dbm(&self) -> f64 {
        self.tx_power_ladder_dbm()[0]
    }

    /// Minimum TX power, dBm.
    pub fn min_power_dbm(&self) -> f64 {
        *self
            .tx_power_ladder_dbm()
            .last()
            .expect("ladder is never empty")
    }

    /// Duty-cycle fraction mandated for the region's default band, if
    /// any. EU868 and KR920 enforce 1%; the others rely on dwell time,
    /// which the engine models through the configured cap instead.
    pub fn default_duty_cycle(&self) -> Option<f64> {
        match self {
            Region::Eu868 | Region::Kr920 => Some(0.01),
            _ => None,
        }
    }
}
