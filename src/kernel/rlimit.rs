//! setrlimit wrappers used by the init process.

use crate::config::settings::RlimitSettings;
use crate::config::types::{IsolateError, Result};

#[cfg(target_env = "gnu")]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(target_env = "gnu"))]
type Resource = libc::c_int;

fn apply_rlimit_value(name: &str, resource: Resource, soft: u64, hard: u64) -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };

    // SAFETY: setrlimit only reads the struct we pass.
    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc == 0 {
        return Ok(());
    }

    Err(IsolateError::Process(format!(
        "Failed to apply {}={} (hard={}): {}",
        name,
        soft,
        hard,
        std::io::Error::last_os_error()
    )))
}

/// Apply the configured static limits. In permissive mode failures are
/// returned as warnings instead of errors.
pub fn apply_static_limits(settings: &RlimitSettings, strict_mode: bool) -> Result<Vec<String>> {
    let kb = |v: u64| v.saturating_mul(1024);
    let table: [(&str, Resource, Option<u64>); 4] = [
        ("RLIMIT_STACK", libc::RLIMIT_STACK, settings.stack_kb.map(kb)),
        ("RLIMIT_NOFILE", libc::RLIMIT_NOFILE, settings.open_files),
        ("RLIMIT_FSIZE", libc::RLIMIT_FSIZE, settings.file_size_kb.map(kb)),
        ("RLIMIT_CORE", libc::RLIMIT_CORE, settings.core_kb.map(kb)),
    ];

    let mut warnings = Vec::new();
    for (name, resource, value) in table {
        let Some(value) = value else { continue };
        if let Err(e) = apply_rlimit_value(name, resource, value, value) {
            if strict_mode {
                return Err(e);
            }
            warnings.push(e.to_string());
        }
    }
    Ok(warnings)
}

/// Soft and hard `RLIMIT_CPU` for a CPU ceiling in milliseconds: the soft
/// limit is the ceiling rounded up to whole seconds, the hard one a second
/// later.
pub fn cpu_limit_seconds(cpu_time_ms: u64) -> (u64, u64) {
    let soft = cpu_time_ms.div_ceil(1000).max(1);
    (soft, soft + 1)
}

/// Kernel-side backstop for a CPU ceiling; the monitor normally kills first.
pub fn apply_cpu_limit(cpu_time_ms: u64) -> Result<()> {
    let (soft, hard) = cpu_limit_seconds(cpu_time_ms);
    apply_rlimit_value("RLIMIT_CPU", libc::RLIMIT_CPU, soft, hard)
}
