//! # lwsim
//!
//! CLI runner for the lwsim LoRaWAN network simulator.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lwsim_model::presets::{long_range_scenario, Environment};
use lwsim_model::{ini::IniScenario, Scenario, TrafficModel};
use lwsim_runner::metrics_export::InMemoryRecorder;
use lwsim_runner::{
    print_summary, write_metrics_csv, write_trace_file, write_validation_row, RunnerError,
};
use lwsim_sim::simulator::Simulator;

/// Output format for the metrics file.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum MetricsFormat {
    Json,
    Csv,
}

/// lwsim - LoRaWAN network simulator
#[derive(Parser, Debug)]
#[command(name = "lwsim")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scenario (YAML, or a reference-style INI)
    Run(RunConfig),
    /// Run a scenario and print the .sca-style validation row
    Validate(RunConfig),
    /// Run a built-in long-range preset scenario
    LongRange(LongRangeConfig),
    /// List the metrics the engine emits
    Metrics,
}

#[derive(Parser, Debug)]
struct RunConfig {
    /// Scenario file (.yaml/.yml, or .ini in the reference format)
    scenario: PathBuf,

    /// Override the scenario seed
    #[arg(long)]
    seed: Option<u64>,

    /// Override the simulated duration (e.g. `600`, `30m`, `24h`)
    #[arg(long, value_parser = parse_duration)]
    duration: Option<f64>,

    /// Write the event trace (JSON) to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write aggregate metrics to this file
    #[arg(long)]
    metrics_output: Option<PathBuf>,

    /// Format of the metrics file
    #[arg(long, value_enum, default_value = "json")]
    metrics_format: MetricsFormat,
}

#[derive(Parser, Debug)]
struct LongRangeConfig {
    /// Preset name: rural_long_range or very_long_range
    #[arg(default_value = "rural_long_range")]
    preset: String,

    /// Random seed
    #[arg(long, default_value = "3")]
    seed: u64,

    /// Packets each node transmits
    #[arg(long, default_value = "8")]
    packets_per_node: u32,
}

/// Seconds per duration unit letter.
fn unit_scale(unit: char) -> Option<f64> {
    match unit {
        's' => Some(1.0),
        'm' => Some(60.0),
        'h' => Some(3600.0),
        'd' => Some(86400.0),
        _ => None,
    }
}

/// Parse a duration string into seconds.
///
/// The string is a sequence of `<value><unit>` segments (`24h`,
/// `1h30m`); a segment without a unit letter is taken as seconds, so
/// bare numbers work too.
fn parse_duration(s: &str) -> Result<f64, String> {
    let text = s.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }

    // Every unit letter closes a segment, so "1h30m" splits into
    // ["1h", "30m"] and "600" stays a single unitless segment.
    let mut total = 0.0;
    for segment in text.split_inclusive(|c: char| c.is_ascii_alphabetic()) {
        let (digits, scale) = match segment.strip_suffix(|c: char| c.is_ascii_alphabetic()) {
            Some(digits) => {
                let unit = segment.chars().next_back().expect("suffix was just stripped");
                let scale = unit_scale(unit)
                    .ok_or_else(|| format!("unknown unit '{unit}' in '{s}' (use s, m, h or d)"))?;
                (digits, scale)
            }
            None => (segment, 1.0),
        };
        let value: f64 = digits
            .parse()
            .map_err(|_| format!("bad number '{digits}' in duration '{s}'"))?;
        total += value * scale;
    }

    if total <= 0.0 {
        return Err(format!("duration '{s}' must be positive"));
    }
    Ok(total)
}

/// Load a scenario from YAML, or adapt a reference INI description.
fn load_scenario(path: &Path) -> Result<Scenario, RunnerError> {
    let is_ini = path
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("ini"));
    if !is_ini {
        return Ok(Scenario::load(path)?);
    }
    let ini = IniScenario::load(path)?;
    let scenario = Scenario {
        num_nodes: ini.nodes.len(),
        num_gateways: ini.gateways.len().max(1),
        nodes: ini.nodes.clone(),
        gateways: ini.gateways.clone(),
        traffic: TrafficModel::Random {
            mean_interval_s: ini.effective_mean_interval_s(),
        },
        first_packet_interval_s: ini.first_interval_s,
        reference_mode: true,
        ..Scenario::default()
    };
    scenario.validate()?;
    Ok(scenario)
}

fn apply_overrides(scenario: &mut Scenario, config: &RunConfig) {
    if let Some(seed) = config.seed {
        scenario.seed = seed;
    }
    if let Some(duration) = config.duration {
        scenario.max_sim_time_s = Some(duration);
    }
}

fn execute(scenario: &Scenario, config: &RunConfig, validation: bool) -> Result<(), RunnerError> {
    let recorder = InMemoryRecorder::new();
    recorder.install();

    let mut sim = Simulator::new(scenario)?;
    sim.run()?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if validation {
        write_validation_row(&sim.metrics(), &mut out)?;
    } else {
        print_summary(&sim, &mut out)?;
    }

    if let Some(path) = &config.output {
        write_trace_file(sim.trace(), path)?;
    }
    if let Some(path) = &config.metrics_output {
        let mut file = std::fs::File::create(path)?;
        match config.metrics_format {
            MetricsFormat::Json => {
                // The aggregate metrics plus whatever the facade
                // recorder collected during the run.
                let report = serde_json::json!({
                    "summary": sim.metrics(),
                    "recorder": recorder.snapshot(),
                });
                serde_json::to_writer_pretty(&mut file, &report)?;
                use std::io::Write;
                writeln!(file)?;
            }
            MetricsFormat::Csv => write_metrics_csv(&sim.metrics(), &mut file)?,
        }
    }
    Ok(())
}

fn run_long_range(config: &LongRangeConfig) -> Result<(), RunnerError> {
    let environment = Environment::from_name(&config.preset)?;
    let scenario = long_range_scenario(environment, config.seed, config.packets_per_node)?;
    let mut sim = Simulator::new(&scenario)?;
    sim.run()?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    print_summary(&sim, &mut out)?;
    write_validation_row(&sim.metrics(), &mut out)?;
    Ok(())
}

fn list_metrics() {
    for def in lwsim_sim::metrics_defs::ALL {
        println!("{:<32} {}", def.name, def.help);
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::Run(config) => {
            load_scenario(&config.scenario).and_then(|mut scenario| {
                apply_overrides(&mut scenario, config);
                execute(&scenario, config, false)
            })
        }
        Commands::Validate(config) => {
            load_scenario(&config.scenario).and_then(|mut scenario| {
                apply_overrides(&mut scenario, config);
                execute(&scenario, config, true)
            })
        }
        Commands::LongRange(config) => run_long_range(config),
        Commands::Metrics => {
            list_metrics();
            Ok(())
        }
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("90").unwrap(), 90.0);
        assert_eq!(parse_duration("90s").unwrap(), 90.0);
        assert_eq!(parse_duration("30m").unwrap(), 1800.0);
        assert_eq!(parse_duration("24h").unwrap(), 86400.0);
        assert_eq!(parse_duration("1h30m").unwrap(), 5400.0);
        assert!(parse_duration("xyz").is_err());
        assert!(parse_duration("10w").is_err());
    }
}
