/// Configuration loading from sandcell.json
use crate::config::types::{DirectoryBinding, IsolateError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "SANDCELL_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "sandcell.json";

/// Full sandcell.json structure. Every section and field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    pub container: ContainerSettings,
    pub cgroup: CgroupSettings,
    pub monitor: MonitorSettings,
    pub rlimits: RlimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerSettings {
    /// Parent of the per-container root directories
    pub root_dir: PathBuf,
    /// Where container id lock files live
    pub lock_dir: PathBuf,
    pub max_containers: u32,
    /// Fail instead of warn when an optional hardening step is refused
    pub strict_mode: bool,
    pub mount_namespace: bool,
    pub network_namespace: bool,
    pub user_namespace: bool,
    pub hostname: String,
    /// `source=target:options` entries, see [`DirectoryBinding::parse`]
    pub bindings: Vec<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/tmp/sandcell/roots"),
            lock_dir: PathBuf::from("/tmp/sandcell/locks"),
            max_containers: 64,
            strict_mode: false,
            mount_namespace: true,
            network_namespace: true,
            user_namespace: false,
            hostname: "sandcell".to_string(),
            bindings: vec![
                "/bin".to_string(),
                "/usr".to_string(),
                "/lib".to_string(),
                "/lib64:maybe".to_string(),
                "/lib32:maybe".to_string(),
                "/tmp:tmp,rw".to_string(),
            ],
            uid: None,
            gid: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CgroupSettings {
    /// Mount point of the cgroup filesystem
    pub root: PathBuf,
    /// Directory under the root (per controller on v1) grouping all containers
    pub prefix: String,
    pub force_v1: bool,
}

impl Default for CgroupSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(crate::kernel::cgroup::backend::DEFAULT_CGROUP_ROOT),
            prefix: "sandcell".to_string(),
            force_v1: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorSettings {
    pub poll_interval_ms: u64,
    /// How long init gets to report after its program tree was killed
    pub kill_grace_ms: u64,
    pub setup_timeout_ms: u64,
    /// Wall clock ceiling when a request sets none
    pub default_wall_time_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            kill_grace_ms: 2000,
            setup_timeout_ms: 5000,
            default_wall_time_ms: 30_000,
        }
    }
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn default_wall_time(&self) -> Duration {
        Duration::from_millis(self.default_wall_time_ms)
    }
}

/// Static rlimits applied once by init; `None` leaves the inherited value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RlimitSettings {
    pub stack_kb: Option<u64>,
    pub open_files: Option<u64>,
    pub file_size_kb: Option<u64>,
    pub core_kb: Option<u64>,
}

impl Default for RlimitSettings {
    fn default() -> Self {
        Self {
            stack_kb: Some(64 * 1024),
            open_files: Some(256),
            file_size_kb: Some(64 * 1024),
            core_kb: Some(0),
        }
    }
}

impl SandboxConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config_content = std::fs::read_to_string(path).map_err(|e| {
            IsolateError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: SandboxConfig = serde_json::from_str(&config_content)
            .map_err(|e| IsolateError::Config(format!("Failed to parse config JSON: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// `$SANDCELL_CONFIG`, then `./sandcell.json`, then built-in defaults.
    pub fn load_default() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Self::load_from_file(path);
        }

        let config_path = std::env::current_dir()
            .map_err(|e| IsolateError::Config(format!("Failed to get current directory: {}", e)))?
            .join(DEFAULT_CONFIG_FILE);

        if config_path.exists() {
            return Self::load_from_file(config_path);
        }

        log::debug!("No {} found, using built-in defaults", DEFAULT_CONFIG_FILE);
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor.poll_interval_ms == 0 {
            return Err(IsolateError::Config(
                "monitor.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.monitor.setup_timeout_ms == 0 {
            return Err(IsolateError::Config(
                "monitor.setup_timeout_ms must be positive".to_string(),
            ));
        }
        if self.container.max_containers == 0 {
            return Err(IsolateError::Config(
                "container.max_containers must be positive".to_string(),
            ));
        }
        if self.cgroup.prefix.is_empty()
            || self.cgroup.prefix.contains('/')
            || self.cgroup.prefix.starts_with('.')
        {
            return Err(IsolateError::Config(format!(
                "Invalid cgroup prefix: '{}'",
                self.cgroup.prefix
            )));
        }
        if self.container.hostname.is_empty() || self.container.hostname.len() > 64 {
            return Err(IsolateError::Config(format!(
                "Invalid hostname: '{}'",
                self.container.hostname
            )));
        }
        self.bindings().map(|_| ())
    }

    pub fn bindings(&self) -> Result<Vec<DirectoryBinding>> {
        self.container
            .bindings
            .iter()
            .map(|b| DirectoryBinding::parse(b))
            .collect()
    }
}
