//! Reference-simulator INI compatibility.
//!
//! Reads the scenario descriptions the reference uses: wildcard keys of
//! the form `**.loRaNodes[0].**.initialX = 450m` plus the traffic mean in
//! `**.timeToNextPacket = exponential(1000s)`. Only positions, initial
//! radio parameters and the traffic mean are extracted; everything else
//! in the file is ignored.

use std::path::Path;

use crate::{GatewayPlacement, ModelError, NodePlacement};

/// Mean inter-arrival applied when the INI does not set
/// `timeToNextPacket`, seconds.
pub const DEFAULT_MEAN_INTERVAL_S: f64 = 100.0;

/// Result of parsing a reference INI scenario.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IniScenario {
    pub nodes: Vec<NodePlacement>,
    pub gateways: Vec<GatewayPlacement>,
    /// Mean inter-arrival time, seconds.
    pub mean_interval_s: Option<f64>,
    /// Mean interval for the first packet only, seconds.
    pub first_interval_s: Option<f64>,
}

impl IniScenario {
    pub fn load(path: &Path) -> Result<IniScenario, ModelError> {
        let text = std::fs::read_to_string(path)?;
        parse(&text)
    }

    /// Effective mean interval: the file's value or the reference default.
    pub fn effective_mean_interval_s(&self) -> f64 {
        self.mean_interval_s.unwrap_or(DEFAULT_MEAN_INTERVAL_S)
    }
}

/// Strip a FLoRa unit suffix and parse the number.
fn parse_numeric(value: &str) -> Result<f64, ModelError> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    let (digits, scale) = if let Some(v) = compact.strip_suffix("dBm") {
        (v, 1.0)
    } else if let Some(v) = compact.strip_suffix("kHz") {
        (v, 1e3)
    } else if let Some(v) = compact.strip_suffix("MHz") {
        (v, 1e6)
    } else if let Some(v) = compact.strip_suffix('s') {
        (v, 1.0)
    } else if let Some(v) = compact.strip_suffix('m') {
        (v, 1.0)
    } else {
        (compact.as_str(), 1.0)
    };
    digits
        .parse::<f64>()
        .map(|v| v * scale)
        .map_err(|_| ModelError::InvalidIni(format!("cannot parse numeric value '{value}'")))
}

/// Parse `exponential(1000s)` or a bare number.
fn parse_interval(value: &str) -> Result<f64, ModelError> {
    let v = value.trim();
    if let Some(inner) = v.strip_prefix("exponential(").and_then(|r| r.strip_suffix(')')) {
        return parse_numeric(inner);
    }
    parse_numeric(v)
}

/// Split `loRaNodes[3].**.initialX` into (index, attribute).
fn indexed_key<'a>(key: &'a str, prefix: &str) -> Option<(usize, &'a str)> {
    let rest = key.strip_prefix(prefix)?;
    let (idx, tail) = rest.split_once(']')?;
    let attr = tail.rsplit('.').next()?.trim_start_matches('*');
    Some((idx.parse().ok()?, attr))
}

/// Parse INI text into placements and traffic means.
pub fn parse(text: &str) -> Result<IniScenario, ModelError> {
    use std::collections::BTreeMap;

    #[derive(Default, Clone)]
    struct NodeAcc {
        x: f64,
        y: f64,
        sf: Option<u8>,
        tx_power: Option<f64>,
    }

    let mut nodes: BTreeMap<usize, NodeAcc> = BTreeMap::new();
    let mut gateways: BTreeMap<usize, GatewayPlacement> = BTreeMap::new();
    let mut out = IniScenario::default();

    for raw_line in text.lines() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().trim_start_matches("**.");
        let value = value.trim().trim_matches('"');

        if key.ends_with("timeToFirstPacket") {
            out.first_interval_s = Some(parse_interval(value)?);
            continue;
        }
        if key.ends_with("timeToNextPacket") {
            out.mean_interval_s = Some(parse_interval(value)?);
            continue;
        }

        if let Some((idx, attr)) = indexed_key(key, "loRaNodes[") {
            let node = nodes.entry(idx).or_default();
            match attr {
                "initialX" => node.x = parse_numeric(value)?,
                "initialY" => node.y = parse_numeric(value)?,
                "initialLoRaSF" => node.sf = Some(parse_numeric(value)? as u8),
                "initialLoRaTP" => node.tx_power = Some(parse_numeric(value)?),
                _ => {}
            }
            continue;
        }
        if let Some((idx, attr)) = indexed_key(key, "loRaGW[") {
            let gw = gateways.entry(idx).or_insert(GatewayPlacement { x: 0.0, y: 0.0 });
            match attr {
                "initialX" => gw.x = parse_numeric(value)?,
                "initialY" => gw.y = parse_numeric(value)?,
                _ => {}
            }
        }
    }

    out.nodes = nodes
        .into_values()
        .map(|n| NodePlacement {
            x: n.x,
            y: n.y,
            sf: n.sf,
            tx_power_dbm: n.tx_power,
        })
        .collect();
    out.gateways = gateways.into_values().collect();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[General]
**.loRaNodes[0].**initialX = 450m
**.loRaNodes[0].**initialY = 250m
**.loRaNodes[0].**initialLoRaSF = 9
**.loRaNodes[0].**initialLoRaTP = 14dBm
**.loRaNodes[1].**initialX = 120.5m
**.loRaNodes[1].**initialY = 80m
**.loRaGW[0].**.initialX = 500m
**.loRaGW[0].**.initialY = 500m
**.timeToNextPacket = exponential(1000s)
"#;

    #[test]
    fn parses_positions_and_interval() {
        let scenario = parse(SAMPLE).unwrap();
        assert_eq!(scenario.nodes.len(), 2);
        assert_eq!(scenario.gateways.len(), 1);
        assert!((scenario.nodes[0].x - 450.0).abs() < 1e-12);
        assert_eq!(scenario.nodes[0].sf, Some(9));
        assert_eq!(scenario.nodes[0].tx_power_dbm, Some(14.0));
        assert!((scenario.nodes[1].x - 120.5).abs() < 1e-12);
        assert!((scenario.gateways[0].y - 500.0).abs() < 1e-12);
        assert_eq!(scenario.mean_interval_s, Some(1000.0));
    }

    #[test]
    fn missing_interval_defaults_to_100s() {
        let scenario = parse("**.loRaNodes[0].**initialX = 1m\n").unwrap();
        assert_eq!(scenario.mean_interval_s, None);
        assert!((scenario.effective_mean_interval_s() - DEFAULT_MEAN_INTERVAL_S).abs() < 1e-12);
    }

    #[test]
    fn comments_and_junk_lines_are_ignored() {
        let text = "# comment\nrandom line\n**.loRaGW[0].**.initialX = 5m # trailing\n";
        let scenario = parse(text).unwrap();
        assert_eq!(scenario.gateways.len(), 1);
        assert!((scenario.gateways[0].x - 5.0).abs() < 1e-12);
    }

    #[test]
    fn bad_numeric_is_an_error() {
        assert!(parse("**.loRaNodes[0].**initialX = abc\n").is_err());
    }

    #[test]
    fn units_are_stripped() {
        assert!((parse_numeric("868.1 MHz").unwrap() - 868_100_000.0).abs() < 1.0);
        assert!((parse_numeric("125 kHz").unwrap() - 125_000.0).abs() < 1e-9);
        assert!((parse_numeric("14dBm").unwrap() - 14.0).abs() < 1e-12);
        assert!((parse_interval("exponential(100s)").unwrap() - 100.0).abs() < 1e-12);
    }
}
