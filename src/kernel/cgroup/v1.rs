//! Cgroup v1 resource governance.
//!
//! One directory per controller: `<root>/<controller>/<prefix>/<name>`.

use crate::config::types::{IsolateError, Result};
use crate::kernel::cgroup::backend::{
    self, is_missing, read_keyed, read_pids, read_u64, write_file, CgroupBackend, Subsystem,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Value the v1 memory controller accepts as "no limit".
const UNLIMITED: &str = "-1";

pub struct CgroupV1 {
    root: PathBuf,
    relative: PathBuf,
    enabled: BTreeSet<Subsystem>,
}

impl CgroupV1 {
    pub fn new(root: &Path, prefix: &str, name: &str) -> Result<Self> {
        backend::validate_name(name)?;
        Ok(Self {
            root: root.to_path_buf(),
            relative: Path::new(prefix).join(name),
            enabled: BTreeSet::new(),
        })
    }

    fn file(&self, subsystem: Subsystem, name: &str) -> PathBuf {
        self.subsystem_path(subsystem).join(name)
    }

    /// Some kernels only expose the non-recursive blkio counters.
    fn blkio_file(&self) -> PathBuf {
        let recursive = self.file(Subsystem::BlockIo, "blkio.throttle.io_service_bytes_recursive");
        if recursive.exists() {
            recursive
        } else {
            self.file(Subsystem::BlockIo, "blkio.throttle.io_service_bytes")
        }
    }
}

impl CgroupBackend for CgroupV1 {
    fn backend_name(&self) -> &'static str {
        "cgroup_v1"
    }

    fn subsystem_path(&self, subsystem: Subsystem) -> PathBuf {
        self.root
            .join(subsystem.v1_controller())
            .join(&self.relative)
    }

    fn enable_subsystem(&mut self, subsystem: Subsystem) -> Result<()> {
        let controller_root = self.root.join(subsystem.v1_controller());
        if !controller_root.is_dir() {
            return Err(IsolateError::Cgroup(format!(
                "Controller '{}' is not mounted under {}",
                subsystem.v1_controller(),
                self.root.display()
            )));
        }

        let path = self.subsystem_path(subsystem);
        fs::create_dir_all(&path).map_err(|e| {
            IsolateError::Cgroup(format!("Failed to create {}: {}", path.display(), e))
        })?;
        self.enabled.insert(subsystem);
        Ok(())
    }

    fn disable_subsystem(&mut self, subsystem: Subsystem) -> Result<()> {
        self.enabled.remove(&subsystem);
        let root_procs = self
            .root
            .join(subsystem.v1_controller())
            .join("cgroup.procs");
        backend::migrate_and_remove(&self.subsystem_path(subsystem), &root_procs)
    }

    fn attach_process(&self, subsystem: Subsystem, pid: u32) -> Result<()> {
        write_file(&self.file(subsystem, "cgroup.procs"), &pid.to_string())
    }

    fn cpu_usage_usec(&self) -> Result<u64> {
        let nanos = read_u64(&self.file(Subsystem::CpuAccounting, "cpuacct.usage"))?;
        Ok(nanos.div_ceil(1000))
    }

    fn memory_peak_bytes(&self) -> Result<u64> {
        read_u64(&self.file(Subsystem::Memory, "memory.max_usage_in_bytes"))
    }

    fn memory_current_bytes(&self) -> Result<u64> {
        read_u64(&self.file(Subsystem::Memory, "memory.usage_in_bytes"))
    }

    fn reset_memory_peak(&mut self) -> Result<bool> {
        let peak = self.file(Subsystem::Memory, "memory.max_usage_in_bytes");
        match fs::write(&peak, "0") {
            Ok(()) => Ok(true),
            Err(e) => {
                log::debug!("memory.max_usage_in_bytes not resettable: {}", e);
                Ok(false)
            }
        }
    }

    fn set_memory_limit(&self, limit_bytes: Option<u64>) -> Result<()> {
        let limit_file = self.file(Subsystem::Memory, "memory.limit_in_bytes");
        let memsw_file = self.file(Subsystem::Memory, "memory.memsw.limit_in_bytes");
        let has_memsw = memsw_file.exists();

        // memsw must never drop below the plain limit, so lift it first
        if has_memsw {
            write_file(&memsw_file, UNLIMITED)?;
        }
        match limit_bytes {
            Some(bytes) => {
                let value = bytes.to_string();
                write_file(&limit_file, &value)?;
                if has_memsw {
                    write_file(&memsw_file, &value)?;
                }
            }
            None => write_file(&limit_file, UNLIMITED)?,
        }
        Ok(())
    }

    fn oom_kill_count(&self) -> Result<u64> {
        read_keyed(&self.file(Subsystem::Memory, "memory.oom_control"), "oom_kill")
    }

    fn io_bytes(&self) -> Result<u64> {
        match fs::read_to_string(self.blkio_file()) {
            Ok(content) => Ok(backend::parse_blkio_service_bytes(&content)),
            Err(e) if is_missing(&e) => Ok(0),
            Err(e) => Err(IsolateError::Cgroup(format!(
                "Failed to read blkio counters: {}",
                e
            ))),
        }
    }

    fn process_count(&self) -> Result<u64> {
        read_u64(&self.file(Subsystem::Pids, "pids.current"))
    }

    fn set_process_limit(&self, limit: Option<u64>) -> Result<()> {
        let value = limit.map_or_else(|| "max".to_string(), |n| n.to_string());
        write_file(&self.file(Subsystem::Pids, "pids.max"), &value)
    }

    fn process_limit_hits(&self) -> Result<u64> {
        read_keyed(&self.file(Subsystem::Pids, "pids.events"), "max")
    }

    fn member_pids(&self) -> Result<Vec<i32>> {
        read_pids(&self.file(Subsystem::Pids, "cgroup.procs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("sandcell-v1-{}", uuid::Uuid::new_v4()));
        for subsystem in Subsystem::ALL {
            fs::create_dir_all(root.join(subsystem.v1_controller())).unwrap();
        }
        root
    }

    #[test]
    fn test_controller_paths() {
        let cgroup = CgroupV1::new(Path::new("/sys/fs/cgroup"), "sandcell", "sandcell-1").unwrap();
        assert_eq!(
            cgroup.subsystem_path(Subsystem::CpuAccounting),
            PathBuf::from("/sys/fs/cgroup/cpuacct/sandcell/sandcell-1")
        );
        assert_eq!(
            cgroup.subsystem_path(Subsystem::BlockIo),
            PathBuf::from("/sys/fs/cgroup/blkio/sandcell/sandcell-1")
        );
    }

    #[test]
    fn test_enable_requires_mounted_controller() {
        let root = std::env::temp_dir().join(format!("sandcell-v1-empty-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&root).unwrap();
        let mut cgroup = CgroupV1::new(&root, "sandcell", "c").unwrap();
        assert!(cgroup.enable_subsystem(Subsystem::Memory).is_err());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_counters_from_fake_hierarchy() {
        let root = fake_root();
        let mut cgroup = CgroupV1::new(&root, "sandcell", "c0").unwrap();
        for subsystem in Subsystem::ALL {
            cgroup.enable_subsystem(subsystem).unwrap();
        }

        fs::write(cgroup.file(Subsystem::CpuAccounting, "cpuacct.usage"), "1500001\n").unwrap();
        fs::write(cgroup.file(Subsystem::Memory, "memory.max_usage_in_bytes"), "65536\n").unwrap();
        fs::write(
            cgroup.file(Subsystem::Memory, "memory.oom_control"),
            "oom_kill_disable 0\nunder_oom 0\noom_kill 2\n",
        )
        .unwrap();
        fs::write(
            cgroup.file(Subsystem::BlockIo, "blkio.throttle.io_service_bytes"),
            "8:0 Read 512\n8:0 Write 512\n8:0 Total 1024\nTotal 1024\n",
        )
        .unwrap();
        fs::write(cgroup.file(Subsystem::Pids, "pids.current"), "2\n").unwrap();

        assert_eq!(cgroup.cpu_usage_usec().unwrap(), 1501);
        assert_eq!(cgroup.memory_peak_bytes().unwrap(), 65536);
        assert_eq!(cgroup.oom_kill_count().unwrap(), 2);
        assert_eq!(cgroup.io_bytes().unwrap(), 1024);
        assert_eq!(cgroup.process_count().unwrap(), 2);
        // pids.events not present on this kernel
        assert_eq!(cgroup.process_limit_hits().unwrap(), 0);

        assert!(cgroup.reset_memory_peak().unwrap());
        assert_eq!(cgroup.memory_peak_bytes().unwrap(), 0);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_memory_limit_with_memsw() {
        let root = fake_root();
        let mut cgroup = CgroupV1::new(&root, "sandcell", "c1").unwrap();
        cgroup.enable_subsystem(Subsystem::Memory).unwrap();
        let memsw = cgroup.file(Subsystem::Memory, "memory.memsw.limit_in_bytes");
        fs::write(&memsw, "9223372036854771712\n").unwrap();

        cgroup.set_memory_limit(Some(4 << 20)).unwrap();
        let limit = cgroup.file(Subsystem::Memory, "memory.limit_in_bytes");
        assert_eq!(fs::read_to_string(&limit).unwrap(), "4194304");
        assert_eq!(fs::read_to_string(&memsw).unwrap(), "4194304");

        cgroup.set_memory_limit(None).unwrap();
        assert_eq!(fs::read_to_string(&limit).unwrap(), "-1");
        assert_eq!(fs::read_to_string(&memsw).unwrap(), "-1");

        fs::remove_dir_all(&root).unwrap();
    }
}
