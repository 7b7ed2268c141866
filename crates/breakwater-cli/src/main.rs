//! `breakwater` command line tool.
//!
//! Validates registry configs and replays outcome scripts against a
//! breaker on a manual clock, so thresholds can be tuned without a live
//! dependency.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use breakwater_core::{
    BreakerConfig, BreakerStatus, CircuitState, OperationOutcome, RegistryConfig, StateMachine,
};
use breakwater_runtime::{Clock, ManualClock};

#[derive(Parser)]
#[command(name = "breakwater")]
#[command(about = "Inspect and simulate circuit breakers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a YAML or JSON registry config and print the effective settings
    Validate {
        /// Path to the config file
        config: PathBuf,
    },

    /// Replay a script of outcomes against one breaker
    Simulate {
        /// Registry config to take the breaker's settings from
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Breaker name, used to pick a per-resource override
        #[arg(short, long, default_value = "default")]
        breaker: String,

        /// Print one JSON status per step
        #[arg(long)]
        json: bool,

        /// Comma-separated steps: ok, fail, slow, wait:<duration>, open:<duration>
        script: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Ok,
    Fail,
    Slow,
    Wait(Duration),
    Open(Duration),
}

impl Step {
    fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let step = match text.split_once(':') {
            None => match text {
                "ok" => Self::Ok,
                "fail" => Self::Fail,
                "slow" => Self::Slow,
                _ => bail!("unknown step '{text}'"),
            },
            Some((kind, duration)) => {
                let duration = humantime::parse_duration(duration.trim())
                    .with_context(|| format!("invalid duration in step '{text}'"))?;
                match kind {
                    "wait" => Self::Wait(duration),
                    "open" => Self::Open(duration),
                    _ => bail!("unknown step '{text}'"),
                }
            }
        };
        Ok(step)
    }
}

#[derive(Serialize)]
struct StepReport {
    step: String,
    /// Admission error when the call was denied
    #[serde(skip_serializing_if = "Option::is_none")]
    denied: Option<String>,
    status: BreakerStatus,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "breakwater=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => validate(&config),
        Commands::Simulate {
            config,
            breaker,
            json,
            script,
        } => simulate(config.as_deref(), &breaker, json, &script),
    }
}

fn load(path: &Path) -> Result<RegistryConfig> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let config = if is_json {
        RegistryConfig::from_json_file(path)
    } else {
        RegistryConfig::from_yaml_file(path)
    };
    config.with_context(|| format!("failed to load {}", path.display()))
}

fn validate(path: &Path) -> Result<()> {
    let config = load(path)?;
    tracing::info!(
        path = %path.display(),
        overrides = config.breakers.len(),
        "Config is valid"
    );

    println!("defaults:");
    print_config(&config.defaults);
    for (name, breaker) in &config.breakers {
        println!("{name}:");
        print_config(breaker);
    }
    Ok(())
}

fn print_config(config: &BreakerConfig) {
    println!("  failure_threshold:   {}", config.failure_threshold);
    println!("  success_threshold:   {}", config.success_threshold);
    println!(
        "  recovery_timeout:    {}",
        humantime::format_duration(config.recovery_timeout)
    );
    println!(
        "  monitoring_period:   {}",
        humantime::format_duration(config.monitoring_period)
    );
    println!(
        "  slow_call_threshold: {}",
        humantime::format_duration(config.slow_call_threshold)
    );
    match config.call_timeout {
        Some(timeout) => println!("  call_timeout:        {}", humantime::format_duration(timeout)),
        None => println!("  call_timeout:        none"),
    }
    println!("  probe_policy:        {:?}", config.probe_policy);
}

fn simulate(config: Option<&Path>, name: &str, json: bool, script: &str) -> Result<()> {
    let registry = match config {
        Some(path) => load(path)?,
        None => RegistryConfig::default(),
    };
    let config = registry.config_for(name).clone();

    let steps = script
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(Step::parse)
        .collect::<Result<Vec<_>>>()?;
    if steps.is_empty() {
        bail!("script has no steps");
    }

    let clock = ManualClock::at_millis(0);
    let mut machine = StateMachine::new(name, config, clock.now())?;

    for (index, step) in steps.iter().enumerate() {
        let denied = apply(&mut machine, &clock, *step);
        let report = StepReport {
            step: format!("{}:{:?}", index + 1, step),
            denied,
            status: machine.status(),
        };

        if json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            print_step(&report, clock.now().timestamp_millis());
        }
    }
    Ok(())
}

/// Apply one step. Returns the denial message if a call was refused.
fn apply(machine: &mut StateMachine, clock: &ManualClock, step: Step) -> Option<String> {
    let outcome = match step {
        Step::Wait(duration) => {
            clock.advance(duration);
            return None;
        }
        Step::Open(duration) => {
            machine.force_open(clock.now(), duration);
            return None;
        }
        Step::Ok => OperationOutcome::success(Duration::ZERO),
        Step::Fail => OperationOutcome::failure(Duration::ZERO),
        Step::Slow => OperationOutcome::success(
            machine.config().slow_call_threshold + Duration::from_millis(1),
        ),
    };

    let now = clock.now();
    match machine.try_admit(now) {
        Ok(_) => {
            machine.record(now, &outcome);
            machine.release_probe();
            None
        }
        Err(denied) => Some(denied.to_string()),
    }
}

fn print_step(report: &StepReport, at_ms: i64) {
    let status = &report.status;
    let marker = match status.state {
        CircuitState::Closed => " ",
        CircuitState::HalfOpen => "~",
        CircuitState::Open => "!",
    };

    print!(
        "{marker} t={at_ms:>8}ms {:<14} {:<9} failures={} successes={}",
        report.step, status.state, status.failure_count, status.success_count
    );
    if let Some(next) = status.next_attempt {
        print!(" next_attempt={}", next.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
    }
    if let Some(denied) = &report.denied {
        print!(" denied: {denied}");
    }
    println!();
}
