//! Discovery and private mounting of the kernel pseudo-filesystems the
//! sensor depends on: tracefs for event schemas and the perf_event cgroupfs
//! for scoping monitoring to containers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Well-known tracefs mount points, newest layout first.
const TRACEFS_CANDIDATES: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// One line of /proc/mounts.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountEntry {
    mount_point: PathBuf,
    fs_type: String,
    options: String,
}

fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let _device = parts.next()?;
            let mount_point = parts.next()?;
            let fs_type = parts.next()?;
            let options = parts.next().unwrap_or("");
            Some(MountEntry {
                mount_point: PathBuf::from(mount_point),
                fs_type: fs_type.to_string(),
                options: options.to_string(),
            })
        })
        .collect()
}

fn read_mounts() -> Vec<MountEntry> {
    match std::fs::read_to_string("/proc/mounts") {
        Ok(text) => parse_mounts(&text),
        Err(e) => {
            debug!(error = %e, "could not read /proc/mounts");
            Vec::new()
        }
    }
}

/// A tracefs root must actually expose event schemas.
fn is_tracefs_root(dir: &Path) -> bool {
    dir.join("events").is_dir()
}

/// Locate a mounted tracefs instance, trying the well-known paths first
/// and falling back to scanning /proc/mounts.
pub fn tracing_dir() -> Option<PathBuf> {
    for candidate in TRACEFS_CANDIDATES {
        let dir = Path::new(candidate);
        if is_tracefs_root(dir) {
            return Some(dir.to_path_buf());
        }
    }

    read_mounts()
        .into_iter()
        .find(|m| m.fs_type == "tracefs" && is_tracefs_root(&m.mount_point))
        .map(|m| m.mount_point)
}

/// Locate the perf_event cgroup hierarchy from /proc/mounts.
pub fn perf_event_dir() -> Option<PathBuf> {
    read_mounts()
        .into_iter()
        .find(|m| {
            m.fs_type == "cgroup" && m.options.split(',').any(|opt| opt == "perf_event")
        })
        .map(|m| m.mount_point)
}

/// Create the run directory if needed and restrict it to mode 0700.
pub fn ensure_run_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating {}", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("restricting permissions on {}", dir.display()))?;
    }

    Ok(())
}

/// Mount a private tracefs under `<run_dir>/tracing`.
#[cfg(target_os = "linux")]
pub fn mount_private_tracefs(run_dir: &Path) -> Result<PathBuf> {
    let dir = run_dir.join("tracing");
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    nix::mount::mount(
        Some("tracefs"),
        &dir,
        Some("tracefs"),
        nix::mount::MsFlags::empty(),
        None::<&str>,
    )
    .with_context(|| format!("mounting tracefs at {}", dir.display()))?;

    Ok(dir)
}

/// Mount a private perf_event cgroup hierarchy under `<run_dir>/perf_event`.
#[cfg(target_os = "linux")]
pub fn mount_private_perf_event(run_dir: &Path) -> Result<PathBuf> {
    let dir = run_dir.join("perf_event");
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    nix::mount::mount(
        Some("cgroup"),
        &dir,
        Some("cgroup"),
        nix::mount::MsFlags::empty(),
        Some("perf_event"),
    )
    .with_context(|| format!("mounting perf_event cgroupfs at {}", dir.display()))?;

    Ok(dir)
}

/// Unmount a private mount created by this module.
#[cfg(target_os = "linux")]
pub fn unmount(dir: &Path) -> Result<()> {
    nix::mount::umount(dir).with_context(|| format!("unmounting {}", dir.display()))
}

#[cfg(not(target_os = "linux"))]
pub fn mount_private_tracefs(_run_dir: &Path) -> Result<PathBuf> {
    anyhow::bail!("private tracefs mounts are only supported on Linux")
}

#[cfg(not(target_os = "linux"))]
pub fn mount_private_perf_event(_run_dir: &Path) -> Result<PathBuf> {
    anyhow::bail!("private perf_event mounts are only supported on Linux")
}

#[cfg(not(target_os = "linux"))]
pub fn unmount(_dir: &Path) -> Result<()> {
    Ok(())
}
