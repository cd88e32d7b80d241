//! sandbridge-replay: run a scripted bridge session against the reference host.
//!
//! # Usage
//!
//! ```bash
//! # Replay a script and print the outcome of every step as JSON
//! sandbridge-replay session.toml
//!
//! # Run a guest program against the bridge imports instead
//! sandbridge-replay --guest program.wasm
//! ```

use clap::Parser;
use env_logger::Env;
use log::{error, info};
use sandbridge_host::{HostConfig, Replay, Script, WasmRunner};
use std::path::{Path, PathBuf};
use std::process;

/// Replay bridge scripts or run guest programs against the reference host.
#[derive(Parser, Debug)]
#[command(name = "sandbridge-replay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the replay script (TOML), or the guest module with --guest
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Treat FILE as a guest module and call its `run` or `_start` export
    #[arg(short, long)]
    guest: bool,

    /// Host configuration for --guest runs (TOML)
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Pretty-print the JSON report
    #[arg(short, long)]
    pretty: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn replay(path: &Path, pretty: bool) -> anyhow::Result<bool> {
    let script = Script::load(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    info!("Replaying {} steps from {}", script.steps.len(), path.display());
    let mut session = Replay::new(&script, base_dir)?;
    let report = session.run(&script.steps);

    let json = if pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", json);

    Ok(report.failures() == 0)
}

fn run_guest(path: &Path, config: Option<&Path>, pretty: bool) -> anyhow::Result<bool> {
    let config = match config {
        Some(config) => HostConfig::from_toml(&std::fs::read(config)?)?,
        None => HostConfig {
            deferred_completions: false,
            ..HostConfig::default()
        },
    };
    let wasm = std::fs::read(path)?;

    info!("Running guest {}", path.display());
    let runner = WasmRunner::new(config)?;
    let outcome = runner.execute(&wasm)?;

    let report = serde_json::json!({
        "entry": outcome.entry,
        "result": outcome.result,
        "stats": outcome.stats,
    });
    let json = if pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", json);

    Ok(outcome.result.unwrap_or(0) == 0)
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    if !args.input.is_file() {
        error!("Not a file: {}", args.input.display());
        process::exit(1);
    }

    let result = if args.guest {
        run_guest(&args.input, args.config.as_deref(), args.pretty)
    } else {
        replay(&args.input, args.pretty)
    };

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(2),
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    }
}
