use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the sensor.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for private mounts and other runtime state. Created with
    /// mode 0700 at startup. Default: "/var/run/tracesensor".
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,

    /// Use this tracefs root instead of discovering or mounting one.
    #[serde(default)]
    pub tracing_dir: Option<PathBuf>,

    /// Never mount a private tracefs; startup fails when none is mounted.
    #[serde(default)]
    pub dont_mount_tracing: bool,

    /// Never mount a private perf_event cgroupfs.
    #[serde(default)]
    pub dont_mount_perf_event: bool,

    /// Cgroup paths to scope monitoring. An empty list, or an entry of ""
    /// or "/", means system-wide.
    #[serde(default)]
    pub cgroup_names: Vec<String>,

    /// Capacity of each subscriber's bounded event channel. Default: 1024.
    #[serde(default = "default_channel_buffer_length")]
    pub channel_buffer_length: usize,

    /// How often the stats reporter logs sensor counters. Default: 60s.
    #[serde(default = "default_stats_report_interval", with = "humantime_serde")]
    pub stats_report_interval: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/var/run/tracesensor")
}

fn default_channel_buffer_length() -> usize {
    1024
}

fn default_stats_report_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            run_dir: default_run_dir(),
            tracing_dir: None,
            dont_mount_tracing: false,
            dont_mount_perf_event: false,
            cgroup_names: Vec::new(),
            channel_buffer_length: default_channel_buffer_length(),
            stats_report_interval: default_stats_report_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.run_dir.as_os_str().is_empty() {
            bail!("run_dir is required");
        }

        if self.channel_buffer_length == 0 {
            bail!("channel_buffer_length must be positive");
        }

        if self.stats_report_interval.is_zero() {
            bail!("stats_report_interval must be positive");
        }

        Ok(())
    }
}
