//! Cgroup backend abstraction for v1/v2 dual support.

use crate::config::settings::CgroupSettings;
use crate::config::types::{IsolateError, Result};
use crate::kernel::signal;
use once_cell::sync::Lazy;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Kernel accounting subsystems every container cgroup carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subsystem {
    CpuAccounting,
    Memory,
    Pids,
    BlockIo,
}

impl Subsystem {
    pub const ALL: [Subsystem; 4] = [
        Subsystem::CpuAccounting,
        Subsystem::Memory,
        Subsystem::Pids,
        Subsystem::BlockIo,
    ];

    /// Directory name of the controller in a v1 hierarchy.
    pub fn v1_controller(self) -> &'static str {
        match self {
            Subsystem::CpuAccounting => "cpuacct",
            Subsystem::Memory => "memory",
            Subsystem::Pids => "pids",
            Subsystem::BlockIo => "blkio",
        }
    }

    /// Controller name written to `cgroup.subtree_control` in a v2 hierarchy.
    pub fn v2_controller(self) -> &'static str {
        match self {
            Subsystem::CpuAccounting => "cpu",
            Subsystem::Memory => "memory",
            Subsystem::Pids => "pids",
            Subsystem::BlockIo => "io",
        }
    }
}

/// One cgroup, seen through whichever kernel interface the host mounts.
///
/// All counters are raw kernel values: the `Cgroup` facade owns epochs and
/// unit conversion.
pub trait CgroupBackend: Send {
    fn backend_name(&self) -> &'static str;
    fn subsystem_path(&self, subsystem: Subsystem) -> PathBuf;
    fn enable_subsystem(&mut self, subsystem: Subsystem) -> Result<()>;
    /// Migrates stragglers to the hierarchy root and removes the directory.
    /// A directory that is already gone is not an error.
    fn disable_subsystem(&mut self, subsystem: Subsystem) -> Result<()>;
    fn attach_process(&self, subsystem: Subsystem, pid: u32) -> Result<()>;

    fn cpu_usage_usec(&self) -> Result<u64>;
    fn memory_peak_bytes(&self) -> Result<u64>;
    fn memory_current_bytes(&self) -> Result<u64>;
    /// Returns false when the kernel offers no way to clear the high-water mark.
    fn reset_memory_peak(&mut self) -> Result<bool>;
    fn set_memory_limit(&self, limit_bytes: Option<u64>) -> Result<()>;
    fn oom_kill_count(&self) -> Result<u64>;
    fn io_bytes(&self) -> Result<u64>;

    fn process_count(&self) -> Result<u64>;
    fn set_process_limit(&self, limit: Option<u64>) -> Result<()>;
    /// Number of forks the kernel rejected because of the process limit.
    fn process_limit_hits(&self) -> Result<u64>;
    fn member_pids(&self) -> Result<Vec<i32>>;

    fn kill_all(&self) -> Result<()> {
        signal_members(&self.member_pids()?, None);
        Ok(())
    }
}

/// SIGKILL every pid in `members` except `except`. Returns how many were
/// still alive to receive the signal.
pub fn signal_members(members: &[i32], except: Option<i32>) -> usize {
    members
        .iter()
        .filter(|pid| Some(**pid) != except)
        .filter(|pid| signal::kill_process(**pid, nix::sys::signal::Signal::SIGKILL))
        .count()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CgroupBackendType {
    V1,
    V2,
}

static DEFAULT_ROOT_BACKEND: Lazy<Option<CgroupBackendType>> =
    Lazy::new(|| detect_cgroup_backend(Path::new(DEFAULT_CGROUP_ROOT)));

/// Detect available cgroup backend under `root`: v2 preferred, v1 fallback.
pub fn detect_cgroup_backend(root: &Path) -> Option<CgroupBackendType> {
    if root.join("cgroup.controllers").exists() {
        return Some(CgroupBackendType::V2);
    }
    if root.join("memory").exists() && root.join("cpuacct").exists() {
        return Some(CgroupBackendType::V1);
    }
    None
}

/// Like [`detect_cgroup_backend`], cached for the default mount point.
pub fn detected_backend(root: &Path) -> Option<CgroupBackendType> {
    if root == Path::new(DEFAULT_CGROUP_ROOT) {
        *DEFAULT_ROOT_BACKEND
    } else {
        detect_cgroup_backend(root)
    }
}

/// Create cgroup backend: v2 default, `force_v1` forces v1.
pub fn create_cgroup_backend(
    settings: &CgroupSettings,
    name: &str,
) -> Result<Box<dyn CgroupBackend>> {
    let detected = detected_backend(&settings.root);

    log::debug!(
        "Cgroup backend selection: force_v1={}, root={}, detected={:?}",
        settings.force_v1,
        settings.root.display(),
        detected
    );

    match (settings.force_v1, detected) {
        (_, Some(CgroupBackendType::V1)) => Ok(Box::new(crate::kernel::cgroup::v1::CgroupV1::new(
            &settings.root,
            &settings.prefix,
            name,
        )?)),
        (false, Some(CgroupBackendType::V2)) => Ok(Box::new(
            crate::kernel::cgroup::v2::CgroupV2::new(&settings.root, &settings.prefix, name)?,
        )),
        (true, Some(CgroupBackendType::V2)) => Err(IsolateError::Cgroup(
            "Cgroup v1 forced but only v2 is mounted".to_string(),
        )),
        (_, None) => Err(IsolateError::Cgroup(format!(
            "No cgroup hierarchy found under {}",
            settings.root.display()
        ))),
    }
}

pub fn backend_type_name(backend_type: CgroupBackendType) -> &'static str {
    match backend_type {
        CgroupBackendType::V1 => "cgroup_v1",
        CgroupBackendType::V2 => "cgroup_v2",
    }
}

/// Reject names that could escape the cgroup prefix.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(IsolateError::Cgroup("Invalid cgroup name length".to_string()));
    }
    if name.contains('/') || name == "." || name == ".." {
        return Err(IsolateError::Cgroup(format!("Invalid cgroup name: {}", name)));
    }
    Ok(())
}

pub(crate) fn is_missing(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::NotFound || err.raw_os_error() == Some(libc::ENODEV)
}

pub(crate) fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| IsolateError::Cgroup(format!("Failed to read {}: {}", path.display(), e)))
}

pub(crate) fn write_file(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value)
        .map_err(|e| IsolateError::Cgroup(format!("Failed to write {}: {}", path.display(), e)))
}

pub(crate) fn read_u64(path: &Path) -> Result<u64> {
    let content = read_file(path)?;
    content.trim().parse::<u64>().map_err(|e| {
        IsolateError::Cgroup(format!("Failed to parse {}: {}", path.display(), e))
    })
}

/// Read one key of a flat keyed file (`key value` per line). A missing file
/// or key reads as zero: the kernel only creates those counters lazily on
/// some versions.
pub(crate) fn read_keyed(path: &Path, key: &str) -> Result<u64> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(parse_keyed_value(&content, key).unwrap_or(0)),
        Err(e) if is_missing(&e) => Ok(0),
        Err(e) => Err(IsolateError::Cgroup(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

pub(crate) fn parse_keyed_value(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse::<u64>().ok(),
            _ => None,
        }
    })
}

/// Sum `rbytes` and `wbytes` over every device line of a v2 `io.stat`.
pub(crate) fn parse_io_stat(content: &str) -> u64 {
    content
        .lines()
        .flat_map(|line| line.split_whitespace().skip(1))
        .filter_map(|field| field.split_once('='))
        .filter(|(key, _)| *key == "rbytes" || *key == "wbytes")
        .filter_map(|(_, value)| value.parse::<u64>().ok())
        .fold(0u64, u64::saturating_add)
}

/// Sum the `Read` and `Write` rows of a v1 `blkio.throttle.io_service_bytes`.
pub(crate) fn parse_blkio_service_bytes(content: &str) -> u64 {
    content
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                [_, "Read", bytes] | [_, "Write", bytes] => bytes.parse::<u64>().ok(),
                _ => None,
            }
        })
        .fold(0u64, u64::saturating_add)
}

pub(crate) fn parse_pid_list(content: &str) -> Vec<i32> {
    content
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .collect()
}

/// Members listed in a `cgroup.procs` file; a vanished cgroup has none.
pub(crate) fn read_pids(procs_file: &Path) -> Result<Vec<i32>> {
    match fs::read_to_string(procs_file) {
        Ok(content) => Ok(parse_pid_list(&content)),
        Err(e) if is_missing(&e) => Ok(Vec::new()),
        Err(e) => Err(IsolateError::Cgroup(format!(
            "Failed to read {}: {}",
            procs_file.display(),
            e
        ))),
    }
}

/// Move whatever is still attached to `dir` into `root_procs`, then remove
/// `dir`. Used by both backends when a subsystem is disabled.
pub(crate) fn migrate_and_remove(dir: &Path, root_procs: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    for pid in read_pids(&dir.join("cgroup.procs"))? {
        if let Err(e) = fs::write(root_procs, pid.to_string()) {
            log::debug!("Failed to migrate pid {} out of {}: {}", pid, dir.display(), e);
        }
    }

    match fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if is_missing(&e) => Ok(()),
        Err(e) => Err(IsolateError::Cgroup(format!(
            "Failed to remove {}: {}",
            dir.display(),
            e
        ))),
    }
}
