/// Cgroup v2 backend implementation
///
/// All subsystems share one directory, `<root>/<prefix>/<name>`. Controllers
/// are delegated through `cgroup.subtree_control` of the root and the prefix.
use crate::config::types::{IsolateError, Result};
use crate::kernel::cgroup::backend::{
    self, is_missing, read_keyed, read_pids, read_u64, signal_members, write_file,
    CgroupBackend, Subsystem,
};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Cgroup v2 backend
pub struct CgroupV2 {
    root: PathBuf,
    path: PathBuf,
    enabled: BTreeSet<Subsystem>,
    /// `memory.peak` descriptor whose write reset the high-water mark; the
    /// reset is only visible through this same descriptor.
    peak_handle: Option<File>,
}

impl CgroupV2 {
    pub fn new(root: &Path, prefix: &str, name: &str) -> Result<Self> {
        backend::validate_name(name)?;
        Ok(CgroupV2 {
            root: root.to_path_buf(),
            path: root.join(prefix).join(name),
            enabled: BTreeSet::new(),
            peak_handle: None,
        })
    }

    fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Best effort: the controllers may already be delegated, or the
    /// hierarchy may be managed by someone else who delegated them for us.
    fn delegate_controllers(&self) {
        let Some(parent) = self.path.parent() else {
            return;
        };
        for level in [self.root.as_path(), parent] {
            let control = level.join("cgroup.subtree_control");
            for subsystem in Subsystem::ALL {
                let entry = format!("+{}", subsystem.v2_controller());
                if let Err(e) = fs::write(&control, &entry) {
                    log::debug!("Could not enable {} in {}: {}", entry, control.display(), e);
                }
            }
        }
    }

    fn read_peak_through_handle(handle: &File) -> Result<u64> {
        let mut reader = handle;
        let mut content = String::new();
        reader
            .seek(SeekFrom::Start(0))
            .and_then(|_| reader.read_to_string(&mut content))
            .map_err(|e| IsolateError::Cgroup(format!("Failed to read memory.peak: {}", e)))?;
        content
            .trim()
            .parse::<u64>()
            .map_err(|e| IsolateError::Cgroup(format!("Failed to parse memory.peak: {}", e)))
    }
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &'static str {
        "cgroup_v2"
    }

    fn subsystem_path(&self, _subsystem: Subsystem) -> PathBuf {
        self.path.clone()
    }

    fn enable_subsystem(&mut self, subsystem: Subsystem) -> Result<()> {
        if self.enabled.is_empty() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    IsolateError::Cgroup(format!(
                        "Failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            self.delegate_controllers();
            match fs::create_dir(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    log::warn!("Reusing stale cgroup {}", self.path.display());
                }
                Err(e) => {
                    return Err(IsolateError::Cgroup(format!(
                        "Failed to create cgroup {}: {}",
                        self.path.display(),
                        e
                    )))
                }
            }
        }
        self.enabled.insert(subsystem);
        Ok(())
    }

    fn disable_subsystem(&mut self, subsystem: Subsystem) -> Result<()> {
        self.enabled.remove(&subsystem);
        if !self.enabled.is_empty() {
            return Ok(());
        }
        self.peak_handle = None;
        backend::migrate_and_remove(&self.path, &self.root.join("cgroup.procs"))
    }

    fn attach_process(&self, _subsystem: Subsystem, pid: u32) -> Result<()> {
        write_file(&self.file("cgroup.procs"), &pid.to_string())
    }

    fn cpu_usage_usec(&self) -> Result<u64> {
        read_keyed(&self.file("cpu.stat"), "usage_usec")
    }

    fn memory_peak_bytes(&self) -> Result<u64> {
        if let Some(handle) = &self.peak_handle {
            return Self::read_peak_through_handle(handle);
        }
        match fs::read_to_string(self.file("memory.peak")) {
            Ok(content) => content.trim().parse::<u64>().map_err(|e| {
                IsolateError::Cgroup(format!("Failed to parse memory.peak: {}", e))
            }),
            // Kernels before 5.19 have no peak file at all
            Err(e) if is_missing(&e) => self.memory_current_bytes(),
            Err(e) => Err(IsolateError::Cgroup(format!(
                "Failed to read memory.peak: {}",
                e
            ))),
        }
    }

    fn memory_current_bytes(&self) -> Result<u64> {
        read_u64(&self.file("memory.current"))
    }

    fn reset_memory_peak(&mut self) -> Result<bool> {
        self.peak_handle = None;
        let opened = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.file("memory.peak"));
        let mut handle = match opened {
            Ok(handle) => handle,
            Err(e) => {
                log::debug!("memory.peak not resettable: {}", e);
                return Ok(false);
            }
        };
        match handle.write_all(b"0") {
            Ok(()) => {
                self.peak_handle = Some(handle);
                Ok(true)
            }
            Err(e) => {
                log::debug!("memory.peak reset rejected by kernel: {}", e);
                Ok(false)
            }
        }
    }

    fn set_memory_limit(&self, limit_bytes: Option<u64>) -> Result<()> {
        let value = limit_bytes.map_or_else(|| "max".to_string(), |b| b.to_string());
        write_file(&self.file("memory.max"), &value)?;

        let swap = self.file("memory.swap.max");
        if swap.exists() {
            let swap_value = if limit_bytes.is_some() { "0" } else { "max" };
            if let Err(e) = fs::write(&swap, swap_value) {
                log::warn!("Failed to set memory.swap.max: {}", e);
            }
        }
        Ok(())
    }

    fn oom_kill_count(&self) -> Result<u64> {
        read_keyed(&self.file("memory.events"), "oom_kill")
    }

    fn io_bytes(&self) -> Result<u64> {
        match fs::read_to_string(self.file("io.stat")) {
            Ok(content) => Ok(backend::parse_io_stat(&content)),
            Err(e) if is_missing(&e) => Ok(0),
            Err(e) => Err(IsolateError::Cgroup(format!("Failed to read io.stat: {}", e))),
        }
    }

    fn process_count(&self) -> Result<u64> {
        match fs::read_to_string(self.file("pids.current")) {
            Ok(content) => content.trim().parse::<u64>().map_err(|e| {
                IsolateError::Cgroup(format!("Failed to parse pids.current: {}", e))
            }),
            Err(e) if is_missing(&e) => Ok(self.member_pids()?.len() as u64),
            Err(e) => Err(IsolateError::Cgroup(format!(
                "Failed to read pids.current: {}",
                e
            ))),
        }
    }

    fn set_process_limit(&self, limit: Option<u64>) -> Result<()> {
        let value = limit.map_or_else(|| "max".to_string(), |n| n.to_string());
        write_file(&self.file("pids.max"), &value)
    }

    fn process_limit_hits(&self) -> Result<u64> {
        read_keyed(&self.file("pids.events"), "max")
    }

    fn member_pids(&self) -> Result<Vec<i32>> {
        read_pids(&self.file("cgroup.procs"))
    }

    fn kill_all(&self) -> Result<()> {
        let kill_file = self.file("cgroup.kill");
        if kill_file.exists() {
            return write_file(&kill_file, "1");
        }
        signal_members(&self.member_pids()?, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("sandcell-v2-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("cgroup.controllers"), "cpu io memory pids\n").unwrap();
        root
    }

    #[test]
    fn test_paths_follow_prefix_and_name() {
        let cgroup = CgroupV2::new(Path::new("/sys/fs/cgroup"), "sandcell", "sandcell-7").unwrap();
        assert_eq!(
            cgroup.subsystem_path(Subsystem::Memory),
            PathBuf::from("/sys/fs/cgroup/sandcell/sandcell-7")
        );
        assert_eq!(
            cgroup.subsystem_path(Subsystem::Memory),
            cgroup.subsystem_path(Subsystem::BlockIo)
        );
    }

    #[test]
    fn test_counters_from_fake_hierarchy() {
        let root = fake_root();
        let mut cgroup = CgroupV2::new(&root, "sandcell", "c0").unwrap();
        for subsystem in Subsystem::ALL {
            cgroup.enable_subsystem(subsystem).unwrap();
        }
        let dir = cgroup.subsystem_path(Subsystem::CpuAccounting);
        assert!(dir.is_dir());

        fs::write(dir.join("cpu.stat"), "usage_usec 2500\nuser_usec 2000\nsystem_usec 500\n").unwrap();
        fs::write(dir.join("memory.current"), "8192\n").unwrap();
        fs::write(dir.join("memory.events"), "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n").unwrap();
        fs::write(dir.join("io.stat"), "8:0 rbytes=10 wbytes=20 rios=1 wios=1\n").unwrap();
        fs::write(dir.join("pids.current"), "3\n").unwrap();
        fs::write(dir.join("pids.events"), "max 4\n").unwrap();
        fs::write(dir.join("cgroup.procs"), "100\n101\n").unwrap();

        assert_eq!(cgroup.cpu_usage_usec().unwrap(), 2500);
        // No memory.peak file: falls back to the current usage
        assert_eq!(cgroup.memory_peak_bytes().unwrap(), 8192);
        assert_eq!(cgroup.oom_kill_count().unwrap(), 1);
        assert_eq!(cgroup.io_bytes().unwrap(), 30);
        assert_eq!(cgroup.process_count().unwrap(), 3);
        assert_eq!(cgroup.process_limit_hits().unwrap(), 4);
        assert_eq!(cgroup.member_pids().unwrap(), vec![100, 101]);

        cgroup.set_memory_limit(Some(1 << 20)).unwrap();
        assert_eq!(fs::read_to_string(dir.join("memory.max")).unwrap(), "1048576");
        cgroup.set_memory_limit(None).unwrap();
        assert_eq!(fs::read_to_string(dir.join("memory.max")).unwrap(), "max");

        cgroup.set_process_limit(Some(5)).unwrap();
        assert_eq!(fs::read_to_string(dir.join("pids.max")).unwrap(), "5");

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_disable_missing_directory_is_noop() {
        let root = fake_root();
        let mut cgroup = CgroupV2::new(&root, "sandcell", "never-created").unwrap();
        cgroup.enabled.insert(Subsystem::Memory);
        assert!(cgroup.disable_subsystem(Subsystem::Memory).is_ok());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_directory_removed_after_last_subsystem() {
        let root = fake_root();
        let mut cgroup = CgroupV2::new(&root, "sandcell", "c1").unwrap();
        cgroup.enable_subsystem(Subsystem::Memory).unwrap();
        cgroup.enable_subsystem(Subsystem::Pids).unwrap();
        let dir = cgroup.subsystem_path(Subsystem::Memory);

        cgroup.disable_subsystem(Subsystem::Memory).unwrap();
        assert!(dir.exists());
        cgroup.disable_subsystem(Subsystem::Pids).unwrap();
        assert!(!dir.exists());

        fs::remove_dir_all(&root).unwrap();
    }
}
