use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use tracesensor::config::Config;
use tracesensor::{mounts, schema};

/// Kernel trace-event telemetry sensor.
#[derive(Parser)]
#[command(name = "tracesensor", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Validate the configuration and report tracefs/perf_event availability.
    Check,

    /// Load and print a trace event schema, e.g. `sched/sched_switch`.
    Describe {
        /// Event name as `<subsystem>/<event>`.
        event: String,
    },
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = &cli.command {
        println!("tracesensor {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Command::Version => unreachable!("handled above"),
        Command::Check => check(&cfg),
        Command::Describe { event } => describe(&cfg, &event),
    }
}

fn check(cfg: &Config) -> Result<()> {
    cfg.validate()?;
    println!("config: ok");

    match cfg.tracing_dir.clone().or_else(mounts::tracing_dir) {
        Some(dir) => println!("tracefs: {}", dir.display()),
        None if cfg.dont_mount_tracing => {
            println!("tracefs: not mounted (private mounts disabled; the sensor would fail)")
        }
        None => println!(
            "tracefs: not mounted (a private mount under {} would be attempted)",
            cfg.run_dir.display(),
        ),
    }

    match mounts::perf_event_dir() {
        Some(dir) => println!("perf_event cgroupfs: {}", dir.display()),
        None => println!("perf_event cgroupfs: not mounted (container scoping degraded)"),
    }

    if cfg.cgroup_names.iter().all(|c| c.is_empty() || c == "/") {
        println!("scope: system-wide");
    } else {
        println!("scope: cgroups {}", cfg.cgroup_names.join(", "));
    }

    Ok(())
}

fn describe(cfg: &Config, event: &str) -> Result<()> {
    let tracefs = cfg
        .tracing_dir
        .clone()
        .or_else(mounts::tracing_dir)
        .context("no mounted tracefs found")?;

    let format = schema::load_format(&tracefs, event)
        .with_context(|| format!("loading schema for {event}"))?;

    println!("event: {event}");
    println!("id: {}", format.id);
    for field in &format.fields {
        let shape = if field.data_loc_size > 0 {
            format!("__data_loc({})", field.data_loc_size)
        } else if field.array_size > 0 {
            format!("[{}]", field.array_size)
        } else {
            String::new()
        };
        println!(
            "  {:<24} {:?}{:<14} offset={} size={}",
            field.name, field.field_type, shape, field.offset, field.size,
        );
    }

    Ok(())
}
