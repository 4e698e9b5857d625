//! # lwsim-runner library
//!
//! Support code behind the `lwsim` binary: error plumbing, the
//! in-memory metrics recorder, and the exporters for event traces,
//! metrics snapshots and `.sca`-style validation rows.

pub mod metrics_export;

use std::io::Write;
use std::path::Path;

use thiserror::Error;

use lwsim_sim::simulator::{SimulationMetrics, Simulator, TraceEvent};

/// Errors surfaced by the runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Scenario loading or validation error.
    #[error("model error: {0}")]
    Model(#[from] lwsim_model::ModelError),

    /// Engine error.
    #[error("simulation error: {0}")]
    Simulation(#[from] lwsim_common::SimError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// CLI-level configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Write the event trace as a JSON array.
pub fn write_trace<W: Write>(trace: &[TraceEvent], writer: &mut W) -> Result<(), RunnerError> {
    serde_json::to_writer_pretty(&mut *writer, trace)?;
    writeln!(writer)?;
    Ok(())
}

/// Write the event trace to a file.
pub fn write_trace_file(trace: &[TraceEvent], path: &Path) -> Result<(), RunnerError> {
    let mut file = std::fs::File::create(path)?;
    write_trace(trace, &mut file)
}

/// Write metrics as pretty JSON.
pub fn write_metrics_json<W: Write>(
    metrics: &SimulationMetrics,
    writer: &mut W,
) -> Result<(), RunnerError> {
    serde_json::to_writer_pretty(&mut *writer, metrics)?;
    writeln!(writer)?;
    Ok(())
}

/// Write the headline metrics as a two-row CSV.
pub fn write_metrics_csv<W: Write>(
    metrics: &SimulationMetrics,
    writer: &mut W,
) -> Result<(), RunnerError> {
    writeln!(
        writer,
        "pdr,tx_attempted,delivered,collisions,no_coverage,duplicates,missed_downlinks,avg_delay_s,throughput_bps,mean_snr_db,energy_nodes_j,energy_gateways_j"
    )?;
    writeln!(
        writer,
        "{:.6},{},{},{},{},{},{},{:.6},{:.3},{:.3},{:.6},{:.6}",
        metrics.pdr,
        metrics.tx_attempted,
        metrics.delivered,
        metrics.collisions,
        metrics.no_coverage,
        metrics.duplicates,
        metrics.missed_downlinks,
        metrics.avg_delay_s,
        metrics.throughput_bps,
        metrics.mean_snr_db,
        metrics.energy_nodes_j,
        metrics.energy_gateways_j,
    )?;
    Ok(())
}

/// Emit the `.sca`-style validation row an external comparator diffs
/// against reference captures.
pub fn write_validation_row<W: Write>(
    metrics: &SimulationMetrics,
    writer: &mut W,
) -> Result<(), RunnerError> {
    for (name, value) in metrics.validation_row() {
        writeln!(writer, "scalar lwsim {name} {value}")?;
    }
    Ok(())
}

/// Human-readable end-of-run summary.
pub fn print_summary<W: Write>(sim: &Simulator, writer: &mut W) -> Result<(), RunnerError> {
    let metrics = sim.metrics();
    writeln!(writer, "simulated time : {:.1} s", metrics.simulated_time_s)?;
    writeln!(
        writer,
        "uplinks        : {} sent, {} delivered (PDR {:.3})",
        metrics.tx_attempted, metrics.delivered, metrics.pdr
    )?;
    writeln!(
        writer,
        "losses         : {} collisions, {} no coverage",
        metrics.collisions, metrics.no_coverage
    )?;
    writeln!(
        writer,
        "downlinks      : {} sent, {} missed",
        metrics.downlinks_sent, metrics.missed_downlinks
    )?;
    writeln!(
        writer,
        "mean SNR       : {:.2} dB, mean delay {:.3} s",
        metrics.mean_snr_db, metrics.avg_delay_s
    )?;
    writeln!(
        writer,
        "energy         : {:.4} J nodes, {:.4} J gateways",
        metrics.energy_nodes_j, metrics.energy_gateways_j
    )?;
    let sf_line: Vec<String> = metrics
        .sf_distribution
        .iter()
        .map(|(sf, count)| format!("SF{sf}:{count}"))
        .collect();
    writeln!(writer, "sf spread      : {}", sf_line.join(" "))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lwsim_model::{ChannelConfig, NodePlacement, Scenario, TrafficModel};
    use lwsim_phy::pathloss::PathLossModel;

    fn tiny_run() -> Simulator {
        let scenario = Scenario {
            num_nodes: 1,
            num_gateways: 1,
            area_size_m: 1000.0,
            nodes: vec![NodePlacement {
                x: 400.0,
                y: 500.0,
                sf: Some(12),
                tx_power_dbm: Some(14.0),
            }],
            channels: vec![ChannelConfig {
                frequency_hz: 868_100_000,
                bandwidth_hz: 125_000,
            }],
            traffic: TrafficModel::Periodic { period_s: 10.0 },
            packets_per_node: 2,
            max_sim_time_s: Some(60.0),
            path_loss: PathLossModel::reference_log_normal().with_shadowing(0.0),
            duty_cycle: None,
            seed: 3,
            ..Scenario::default()
        };
        let mut sim = Simulator::new(&scenario).unwrap();
        sim.run().unwrap();
        sim
    }

    #[test]
    fn trace_serialises_to_a_json_array() {
        let sim = tiny_run();
        let mut buf = Vec::new();
        write_trace(sim.trace(), &mut buf).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert!(parsed.as_array().map_or(false, |a| !a.is_empty()));
    }

    #[test]
    fn validation_row_has_the_comparator_fields() {
        let sim = tiny_run();
        let mut buf = Vec::new();
        write_validation_row(&sim.metrics(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        for field in ["sent", "received", "PDR", "collisions", "snr"] {
            assert!(text.contains(&format!("scalar lwsim {field} ")), "{text}");
        }
    }

    #[test]
    fn json_export_round_trips() {
        let sim = tiny_run();
        let mut buf = Vec::new();
        write_metrics_json(&sim.metrics(), &mut buf).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(parsed["tx_attempted"], 2);
        assert!(parsed["pdr"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn csv_export_has_matching_header_and_row() {
        let sim = tiny_run();
        let mut buf = Vec::new();
        write_metrics_csv(&sim.metrics(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0].split(',').count(),
            lines[1].split(',').count(),
        );
    }
}
