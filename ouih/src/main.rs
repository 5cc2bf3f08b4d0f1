//! Ouinet integration harness - command line runner
//!
//! Runs the transport and cache scenarios against live injector and client
//! binaries and exits non-zero when any of them fails.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ouih_common::{EnvOverrides, Harness, HarnessConfig, Transport, scenarios};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "ouih")]
#[command(author, version, about = "Ouinet integration harness")]
struct Cli {
    /// Path to a TOML harness configuration
    #[arg(short, long, env = "OUIH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scenarios (all registered ones by default)
    Run {
        /// Scenario to run; may be repeated
        #[arg(short, long = "scenario")]
        scenarios: Vec<String>,

        /// Print reports as JSON instead of a summary
        #[arg(long)]
        json: bool,

        /// Keep the run directory even when every scenario passes
        #[arg(long)]
        keep_run_dir: bool,
    },

    /// List registered scenarios
    List,

    /// Show the effective readiness timeout of every scenario
    Timeouts,

    /// Validate the configuration and print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            scenarios,
            json,
            keep_run_dir,
        } => {
            let mut config = config;
            if keep_run_dir {
                config.defaults.keep_run_dir = true;
            }
            let passed = run(config, &scenarios, json).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::List => {
            for line in scenario_lines(&config) {
                println!("{line}");
            }
        }
        Commands::Timeouts => {
            for line in timeout_lines(&config) {
                println!("{line}");
            }
        }
        Commands::CheckConfig => {
            config.validate()?;
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}

/// Defaults, then the config file, then `OUIH_*` overrides.
fn load_config(path: Option<&PathBuf>) -> Result<HarnessConfig> {
    let mut config = match path {
        Some(path) => HarnessConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => HarnessConfig::default(),
    };

    let overrides = EnvOverrides::from_env()?;
    if !overrides.is_empty() {
        debug!(?overrides, "applying environment overrides");
        overrides.apply(&mut config);
    }
    config.validate()?;
    Ok(config)
}

async fn run(config: HarnessConfig, scenarios: &[String], json: bool) -> Result<bool> {
    let mut harness = Harness::new(config)?.with_builtin_scenarios()?;
    let reports = harness.run_all(scenarios).await?;

    if json {
        let values = reports
            .iter()
            .map(serde_json::to_value)
            .collect::<serde_json::Result<Vec<_>>>()?;
        println!("{}", serde_json::to_string_pretty(&values)?);
    } else {
        for report in &reports {
            print!("{}", report.summary());
        }
    }

    let failed = reports.iter().filter(|r| !r.passed()).count();
    info!(
        total = reports.len(),
        failed,
        run_dir = %harness.run_dir().display(),
        "harness finished"
    );
    Ok(harness.all_passed())
}

/// One line per built-in scenario. Reads the config only; no run directory.
fn scenario_lines(config: &HarnessConfig) -> Vec<String> {
    scenarios::builtin(config)
        .iter()
        .map(|scenario| {
            format!(
                "{:<24} {:<10} {}",
                scenario.name, scenario.transport, scenario.description
            )
        })
        .collect()
}

fn timeout_lines(config: &HarnessConfig) -> Vec<String> {
    let policy = config.timeout_policy();
    let mut lines = vec![format!("default: {}", humanize(policy.default_timeout()))];
    for scenario in scenarios::builtin(config) {
        let (timeout, source) = policy.resolve_with_source(&scenario.name, scenario.transport);
        let deadline = scenario
            .deadline
            .map(|deadline| format!(", deadline {}", humanize(deadline)))
            .unwrap_or_default();
        lines.push(format!(
            "{:<24} {:>8} ({source}{deadline})",
            scenario.name,
            humanize(timeout)
        ));
    }
    for transport in Transport::ALL {
        let settings = config.transport(transport);
        lines.push(format!(
            "transport {:<14} {:>8} x{} trials",
            transport.as_str(),
            humanize(settings.timeout),
            settings.max_trials
        ));
    }
    lines
}

fn humanize(duration: std::time::Duration) -> String {
    humantime::format_duration(duration).to_string()
}
