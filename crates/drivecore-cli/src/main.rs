//! `drivecore-cli` – operator command line for the drivecore stack.
//!
//! ```text
//! drivecore replay <scenario.json> [--json]   replay a recorded scenario
//! drivecore schema                            print the CycleRecord JSON Schema
//! drivecore config show                       print the effective configuration
//! drivecore config init [--force]             write a default config file
//! ```
//!
//! Ctrl-C publishes an `OperatorStop` alert on the event bus; a running
//! replay hands control to the driver and stops before its next cycle.

mod config;
mod replay;

use colored::Colorize;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use drivecore_middleware::{EventBus, Topic};
use drivecore_types::{Alert, AlertKind, CycleRecord, DriveState, Event, EventPayload, VehicleId};

const USAGE: &str = "\
Usage:
  drivecore replay <scenario.json> [--json]
  drivecore schema
  drivecore config show
  drivecore config init [--force]
  drivecore help";

fn main() -> ExitCode {
    let _tracing = drivecore_runtime::init_tracing("drivecore");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let result = match args.as_slice() {
        ["replay", path, rest @ ..] => match rest {
            [] => cmd_replay(Path::new(path), false),
            ["--json"] => cmd_replay(Path::new(path), true),
            _ => Err(USAGE.to_string()),
        },
        ["schema"] => cmd_schema(),
        ["config", "show"] => cmd_config_show(),
        ["config", "init"] => cmd_config_init(false),
        ["config", "init", "--force"] => cmd_config_init(true),
        [] | ["help"] | ["--help"] | ["-h"] => {
            print_banner();
            println!("{USAGE}");
            Ok(ExitCode::SUCCESS)
        }
        _ => Err(USAGE.to_string()),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// replay
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_replay(path: &Path, json: bool) -> Result<ExitCode, String> {
    let cfg = config::load_or_default()?;
    let scenario = replay::load(path)?;
    let vehicle_id = scenario
        .vehicle_id
        .clone()
        .unwrap_or_else(|| cfg.vehicle_id.clone());

    let bus = EventBus::new(1024);
    let stop = Arc::new(AtomicBool::new(false));
    install_ctrlc(bus.clone(), vehicle_id, stop.clone());

    if !json {
        print_banner();
        println!(
            "  Replaying {} ({} cycle(s))\n",
            path.display().to_string().bold(),
            scenario.cycles.len()
        );
    }

    let output = replay::run(&scenario, &cfg.vehicle_id, &cfg.pipeline, &bus, &stop)
        .map_err(|e| e.to_string())?;

    if json {
        for record in &output.records {
            let line = serde_json::to_string(record)
                .map_err(|e| format!("Failed to serialize cycle record: {}", e))?;
            println!("{line}");
        }
    } else {
        for record in &output.records {
            print_record(record);
        }
        println!();
        for alert in &output.alerts {
            println!("  {} {:?}: {}", "⚠".yellow().bold(), alert.kind, alert.message);
        }
        println!(
            "\n  {} {} cycle(s), {} alert(s)",
            "✓".green().bold(),
            output.records.len(),
            output.alerts.len()
        );
    }

    Ok(if output.interrupted {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    })
}

fn install_ctrlc(bus: EventBus, vehicle_id: VehicleId, stop: Arc<AtomicBool>) {
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("{}", "⚠  Ctrl-C received – operator stop".yellow().bold());
        let event = Event::new(
            "drivecore-cli",
            EventPayload::Alert(Alert {
                vehicle_id: vehicle_id.clone(),
                kind: AlertKind::OperatorStop,
                message: "operator Ctrl-C".to_string(),
            }),
        );
        if bus.publish_to(Topic::Alerts, event).is_ok() {
            eprintln!("{}", "  ✓ OperatorStop published to Event Bus.".green());
        }
        stop.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; operator stop on Ctrl-C will not be available");
    }
}

fn print_record(record: &CycleRecord) {
    let state = format!("{:?}", record.state);
    let state = match record.state {
        DriveState::Nominal => state.green(),
        DriveState::Caution => state.yellow(),
        DriveState::Emergency | DriveState::HumanTakeover => state.red().bold(),
    };
    let avoidance = record
        .avoidance
        .as_ref()
        .map(|a| format!("{:?}", a.action))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  #{:<4} {:<14} {:<28} risk={:<9} conf={:.2} avoid={:<20} route={:?}{}",
        record.cycle,
        state,
        format!("{:?}", record.decision.kind),
        format!("{:?}", record.fusion.aggregate_risk.severity),
        record.fusion.fusion_confidence,
        avoidance,
        record.route.status,
        if record.degraded_output { " (degraded)".dimmed().to_string() } else { String::new() },
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// schema / config
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_schema() -> Result<ExitCode, String> {
    let schema = drivecore_types::cycle_record_schema();
    let raw = serde_json::to_string_pretty(&schema)
        .map_err(|e| format!("Failed to serialize schema: {}", e))?;
    println!("{raw}");
    Ok(ExitCode::SUCCESS)
}

fn cmd_config_show() -> Result<ExitCode, String> {
    let path = config::config_path();
    let cfg = config::load_or_default()?;
    let source = if path.exists() { "file" } else { "defaults" };
    println!("# {} ({})", path.display(), source);
    let raw = toml::to_string_pretty(&cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    println!("{raw}");
    Ok(ExitCode::SUCCESS)
}

fn cmd_config_init(force: bool) -> Result<ExitCode, String> {
    let path = config::config_path();
    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use `config init --force` to overwrite)",
            path.display()
        ));
    }
    config::save(&config::Config::default())?;
    println!("  {} Config saved to {}", "✓".green().bold(), path.display().to_string().bold());
    Ok(ExitCode::SUCCESS)
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("  {} {}",
        "drivecore".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Perception-to-action core for autonomous vehicles");
    println!();
}
