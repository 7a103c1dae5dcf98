//! Cgroup resource governance
//!
//! [`Cgroup`] binds one pid to the four accounting subsystems and measures it
//! in epochs; the v1/v2 details live behind [`CgroupBackend`].

pub mod backend;
pub mod v1;
pub mod v2;

pub use backend::{CgroupBackend, Subsystem};
pub use v1::CgroupV1;
pub use v2::CgroupV2;

use crate::config::settings::CgroupSettings;
use crate::config::types::{IsolateError, Result};
use std::cell::Cell;
use std::path::Path;

/// Kernel counter values captured at the start of an epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Baseline {
    cpu_usec: u64,
    io_bytes: u64,
    oom_kills: u64,
    pid_limit_hits: u64,
}

/// Accounting and limits for one process tree.
///
/// Every counter except [`Cgroup::processes_used`] is relative to the last
/// [`Cgroup::reset`]. Dropping the value disables every subsystem and
/// removes the kernel directories.
pub struct Cgroup {
    name: String,
    pid: u32,
    backend: Box<dyn CgroupBackend>,
    enabled: Vec<Subsystem>,
    baseline: Baseline,
    /// False when the kernel cannot clear its memory high-water mark; the
    /// epoch peak is then the largest current usage sampled so far.
    peak_resettable: bool,
    sampled_peak: Cell<u64>,
}

impl Cgroup {
    /// Create the cgroup `name` for `pid` on whatever hierarchy the host mounts.
    pub fn make_for(pid: u32, name: &str, settings: &CgroupSettings) -> Result<Self> {
        validate_pid(pid)?;
        let backend = backend::create_cgroup_backend(settings, name)?;
        Self::with_backend(name, pid, backend)
    }

    /// Enable every subsystem on `backend` and attach `pid`. On failure the
    /// subsystems already enabled are disabled again before returning.
    pub fn with_backend(name: &str, pid: u32, backend: Box<dyn CgroupBackend>) -> Result<Self> {
        let mut cgroup = Cgroup {
            name: name.to_string(),
            pid,
            backend,
            enabled: Vec::with_capacity(Subsystem::ALL.len()),
            baseline: Baseline::default(),
            peak_resettable: false,
            sampled_peak: Cell::new(0),
        };

        for subsystem in Subsystem::ALL {
            cgroup.backend.enable_subsystem(subsystem)?;
            cgroup.enabled.push(subsystem);
            cgroup
                .backend
                .attach_process(subsystem, pid)
                .map_err(|e| match e {
                    IsolateError::Cgroup(msg) => IsolateError::Cgroup(format!(
                        "Cannot attach pid {} to {:?}: {}",
                        pid, subsystem, msg
                    )),
                    other => other,
                })?;
        }

        cgroup.reset()?;
        log::debug!(
            "Cgroup {} ready on {} for pid {}",
            cgroup.name,
            cgroup.backend.backend_name(),
            pid
        );
        Ok(cgroup)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub fn subsystem_path(&self, subsystem: Subsystem) -> std::path::PathBuf {
        self.backend.subsystem_path(subsystem)
    }

    /// Start a new epoch without recreating the cgroup.
    pub fn reset(&mut self) -> Result<()> {
        self.baseline = Baseline {
            cpu_usec: self.backend.cpu_usage_usec()?,
            io_bytes: self.backend.io_bytes()?,
            oom_kills: self.backend.oom_kill_count()?,
            pid_limit_hits: self.backend.process_limit_hits()?,
        };
        self.peak_resettable = self.backend.reset_memory_peak()?;
        self.sampled_peak.set(self.backend.memory_current_bytes()?);
        Ok(())
    }

    /// CPU time of the epoch in milliseconds, rounded up.
    pub fn cpu_used(&self) -> Result<u64> {
        let usec = self.backend.cpu_usage_usec()?;
        Ok(usec.saturating_sub(self.baseline.cpu_usec).div_ceil(1000))
    }

    /// Peak memory of the epoch in kB, rounded up. Includes exited descendants.
    pub fn memory_used(&self) -> Result<u64> {
        let current = self.backend.memory_current_bytes()?;
        let sampled = self.sampled_peak.get().max(current);
        self.sampled_peak.set(sampled);

        let peak = if self.peak_resettable {
            self.backend.memory_peak_bytes()?.max(sampled)
        } else {
            sampled
        };
        Ok(peak.div_ceil(1024))
    }

    pub fn set_memory_limit(&self, limit_kb: u64) -> Result<()> {
        self.backend
            .set_memory_limit(Some(limit_kb.saturating_mul(1024)))
    }

    pub fn clear_memory_limit(&self) -> Result<()> {
        self.backend.set_memory_limit(None)
    }

    /// OOM kills performed by the kernel during the epoch.
    pub fn oom_kills(&self) -> Result<u64> {
        let count = self.backend.oom_kill_count()?;
        Ok(count.saturating_sub(self.baseline.oom_kills))
    }

    /// Block I/O of the epoch in kB (read + written), rounded up.
    pub fn disk_io_used(&self) -> Result<u64> {
        let bytes = self.backend.io_bytes()?;
        Ok(bytes.saturating_sub(self.baseline.io_bytes).div_ceil(1024))
    }

    /// Tasks attached right now, not epoch based.
    pub fn processes_used(&self) -> Result<u64> {
        self.backend.process_count()
    }

    pub fn set_process_limit(&self, limit: u64) -> Result<()> {
        self.backend.set_process_limit(Some(limit))
    }

    pub fn clear_process_limit(&self) -> Result<()> {
        self.backend.set_process_limit(None)
    }

    /// Forks the kernel rejected during the epoch because of the process limit.
    pub fn process_limit_hits(&self) -> Result<u64> {
        let hits = self.backend.process_limit_hits()?;
        Ok(hits.saturating_sub(self.baseline.pid_limit_hits))
    }

    pub fn members(&self) -> Result<Vec<i32>> {
        self.backend.member_pids()
    }

    /// SIGKILL every attached task except `except`. Returns how many were hit.
    pub fn kill_members(&self, except: i32) -> Result<usize> {
        let members = self.backend.member_pids()?;
        Ok(backend::signal_members(&members, Some(except)))
    }

    pub fn kill_all(&self) -> Result<()> {
        self.backend.kill_all()
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        while let Some(subsystem) = self.enabled.pop() {
            if let Err(e) = self.backend.disable_subsystem(subsystem) {
                log::warn!(
                    "Failed to disable {:?} for cgroup {}: {}",
                    subsystem,
                    self.name,
                    e
                );
            }
        }
    }
}

fn validate_pid(pid: u32) -> Result<()> {
    if pid == 0 {
        return Err(IsolateError::Cgroup("Invalid PID: 0".to_string()));
    }
    if !Path::new(&format!("/proc/{}", pid)).exists() {
        return Err(IsolateError::Cgroup(format!("Process {} does not exist", pid)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Counters {
        cpu_usec: u64,
        peak: u64,
        current: u64,
        peak_resettable: bool,
        oom_kills: u64,
        io_bytes: u64,
        procs: u64,
        pid_hits: u64,
        memory_limit: Option<u64>,
        process_limit: Option<u64>,
        enabled: Vec<Subsystem>,
        disabled: Vec<Subsystem>,
        attached: Vec<u32>,
        fail_attach: bool,
    }

    #[derive(Clone, Default)]
    struct MemoryBackend(Arc<Mutex<Counters>>);

    impl MemoryBackend {
        fn with<R>(&self, f: impl FnOnce(&mut Counters) -> R) -> R {
            f(&mut self.0.lock().unwrap())
        }
    }

    impl CgroupBackend for MemoryBackend {
        fn backend_name(&self) -> &'static str {
            "memory"
        }
        fn subsystem_path(&self, _subsystem: Subsystem) -> PathBuf {
            PathBuf::from("/nowhere")
        }
        fn enable_subsystem(&mut self, subsystem: Subsystem) -> Result<()> {
            self.with(|c| c.enabled.push(subsystem));
            Ok(())
        }
        fn disable_subsystem(&mut self, subsystem: Subsystem) -> Result<()> {
            self.with(|c| c.disabled.push(subsystem));
            Ok(())
        }
        fn attach_process(&self, _subsystem: Subsystem, pid: u32) -> Result<()> {
            self.with(|c| {
                if c.fail_attach {
                    Err(IsolateError::Cgroup("gone".to_string()))
                } else {
                    c.attached.push(pid);
                    Ok(())
                }
            })
        }
        fn cpu_usage_usec(&self) -> Result<u64> {
            Ok(self.with(|c| c.cpu_usec))
        }
        fn memory_peak_bytes(&self) -> Result<u64> {
            Ok(self.with(|c| c.peak))
        }
        fn memory_current_bytes(&self) -> Result<u64> {
            Ok(self.with(|c| c.current))
        }
        fn reset_memory_peak(&mut self) -> Result<bool> {
            Ok(self.with(|c| {
                if c.peak_resettable {
                    c.peak = c.current;
                }
                c.peak_resettable
            }))
        }
        fn set_memory_limit(&self, limit_bytes: Option<u64>) -> Result<()> {
            self.with(|c| c.memory_limit = limit_bytes);
            Ok(())
        }
        fn oom_kill_count(&self) -> Result<u64> {
            Ok(self.with(|c| c.oom_kills))
        }
        fn io_bytes(&self) -> Result<u64> {
            Ok(self.with(|c| c.io_bytes))
        }
        fn process_count(&self) -> Result<u64> {
            Ok(self.with(|c| c.procs))
        }
        fn set_process_limit(&self, limit: Option<u64>) -> Result<()> {
            self.with(|c| c.process_limit = limit);
            Ok(())
        }
        fn process_limit_hits(&self) -> Result<u64> {
            Ok(self.with(|c| c.pid_hits))
        }
        fn member_pids(&self) -> Result<Vec<i32>> {
            Ok(Vec::new())
        }
    }

    fn cgroup_with(backend: &MemoryBackend) -> Cgroup {
        Cgroup::with_backend("sandcell-test", 4242, Box::new(backend.clone())).unwrap()
    }

    #[test]
    fn test_enables_and_attaches_every_subsystem() {
        let backend = MemoryBackend::default();
        let cgroup = cgroup_with(&backend);
        assert_eq!(cgroup.name(), "sandcell-test");
        assert_eq!(cgroup.pid(), 4242);
        backend.with(|c| {
            assert_eq!(c.enabled, Subsystem::ALL.to_vec());
            assert_eq!(c.attached, vec![4242; 4]);
        });
    }

    #[test]
    fn test_drop_disables_in_reverse_order() {
        let backend = MemoryBackend::default();
        drop(cgroup_with(&backend));
        let mut expected = Subsystem::ALL.to_vec();
        expected.reverse();
        backend.with(|c| assert_eq!(c.disabled, expected));
    }

    #[test]
    fn test_failed_attach_tears_down_enabled_subsystems() {
        let backend = MemoryBackend::default();
        backend.with(|c| c.fail_attach = true);
        let result = Cgroup::with_backend("x", 1, Box::new(backend.clone()));
        assert!(matches!(result, Err(IsolateError::Cgroup(_))));
        backend.with(|c| assert_eq!(c.disabled, vec![Subsystem::CpuAccounting]));
    }

    #[test]
    fn test_epoch_counters_are_relative_and_round_up() {
        let backend = MemoryBackend::default();
        backend.with(|c| {
            c.cpu_usec = 1_500;
            c.io_bytes = 10_000;
            c.oom_kills = 2;
            c.pid_hits = 7;
        });
        let mut cgroup = cgroup_with(&backend);
        assert_eq!(cgroup.cpu_used().unwrap(), 0);
        assert_eq!(cgroup.disk_io_used().unwrap(), 0);

        backend.with(|c| {
            c.cpu_usec += 1_001;
            c.io_bytes += 1_025;
            c.oom_kills += 1;
            c.pid_hits += 2;
        });
        assert_eq!(cgroup.cpu_used().unwrap(), 2);
        assert_eq!(cgroup.disk_io_used().unwrap(), 2);
        assert_eq!(cgroup.oom_kills().unwrap(), 1);
        assert_eq!(cgroup.process_limit_hits().unwrap(), 2);

        cgroup.reset().unwrap();
        assert_eq!(cgroup.cpu_used().unwrap(), 0);
        assert_eq!(cgroup.oom_kills().unwrap(), 0);
        assert_eq!(cgroup.process_limit_hits().unwrap(), 0);
    }

    #[test]
    fn test_resettable_peak_is_cleared_by_reset() {
        let backend = MemoryBackend::default();
        backend.with(|c| {
            c.peak_resettable = true;
            c.current = 4096;
            c.peak = 1 << 20;
        });
        let mut cgroup = cgroup_with(&backend);
        assert_eq!(cgroup.memory_used().unwrap(), 4);

        backend.with(|c| c.peak = 10 * 1024 + 1);
        assert_eq!(cgroup.memory_used().unwrap(), 11);

        cgroup.reset().unwrap();
        assert_eq!(cgroup.memory_used().unwrap(), 4);
    }

    #[test]
    fn test_unresettable_peak_uses_sampled_maximum() {
        let backend = MemoryBackend::default();
        backend.with(|c| {
            c.current = 2048;
            c.peak = 1 << 30;
        });
        let mut cgroup = cgroup_with(&backend);
        assert_eq!(cgroup.memory_used().unwrap(), 2);

        backend.with(|c| c.current = 8192);
        assert_eq!(cgroup.memory_used().unwrap(), 8);
        backend.with(|c| c.current = 1024);
        assert_eq!(cgroup.memory_used().unwrap(), 8);

        cgroup.reset().unwrap();
        assert_eq!(cgroup.memory_used().unwrap(), 1);
    }

    #[test]
    fn test_limits_convert_units() {
        let backend = MemoryBackend::default();
        let cgroup = cgroup_with(&backend);

        cgroup.set_memory_limit(256).unwrap();
        cgroup.set_process_limit(9).unwrap();
        backend.with(|c| {
            assert_eq!(c.memory_limit, Some(256 * 1024));
            assert_eq!(c.process_limit, Some(9));
        });

        cgroup.clear_memory_limit().unwrap();
        cgroup.clear_process_limit().unwrap();
        backend.with(|c| {
            assert_eq!(c.memory_limit, None);
            assert_eq!(c.process_limit, None);
        });
    }

    #[test]
    fn test_make_for_rejects_missing_pid() {
        let settings = CgroupSettings::default();
        assert!(matches!(
            Cgroup::make_for(0, "sandcell-x", &settings),
            Err(IsolateError::Cgroup(_))
        ));
    }
}
