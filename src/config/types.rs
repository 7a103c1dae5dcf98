/// Core types shared by the container, the cgroup facade and the init process
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Directory binding configuration for filesystem access
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DirectoryBinding {
    /// Source directory on host system
    pub source: PathBuf,
    /// Target directory within the container root
    pub target: PathBuf,
    /// Access permissions
    pub permissions: DirectoryPermissions,
    /// Ignore if source doesn't exist
    pub maybe: bool,
    /// Mount an empty tmpfs instead of binding the source
    pub is_tmp: bool,
}

/// Directory access permissions
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum DirectoryPermissions {
    /// Read-only access
    ReadOnly,
    /// Read-write access
    ReadWrite,
    /// Read-only and no execution allowed
    NoExec,
}

impl DirectoryBinding {
    /// Parse directory binding from string format like "source=target:options"
    pub fn parse(binding_str: &str) -> Result<Self> {
        let (path_part, options) = match binding_str.split_once(':') {
            Some((path, options)) => (path, options),
            None => (binding_str, ""),
        };

        let (source, target) = match path_part.split_once('=') {
            Some((source, target)) => {
                if source.is_empty() || target.is_empty() || target.contains('=') {
                    return Err(IsolateError::Config(format!(
                        "Invalid directory binding '{}'. Use: source=target or source=target:options",
                        binding_str
                    )));
                }
                (PathBuf::from(source), PathBuf::from(target))
            }
            // If no target specified, use same path in the container
            None => (PathBuf::from(path_part), PathBuf::from(path_part)),
        };

        if !target.is_absolute() {
            return Err(IsolateError::Config(format!(
                "Binding target must be absolute: {}",
                target.display()
            )));
        }
        if target
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(IsolateError::Config(format!(
                "Binding target escapes the container root: {}",
                target.display()
            )));
        }

        let mut permissions = DirectoryPermissions::ReadOnly;
        let mut maybe = false;
        let mut is_tmp = false;

        for option in options.split(',') {
            match option.trim() {
                "rw" => permissions = DirectoryPermissions::ReadWrite,
                "ro" => permissions = DirectoryPermissions::ReadOnly,
                "noexec" => permissions = DirectoryPermissions::NoExec,
                "maybe" => maybe = true,
                "tmp" => is_tmp = true,
                "" => {}
                other => {
                    return Err(IsolateError::Config(format!(
                        "Unknown directory binding option: {}",
                        other
                    )))
                }
            }
        }

        Ok(DirectoryBinding {
            source,
            target,
            permissions,
            maybe,
            is_tmp,
        })
    }
}

/// Resource ceilings for one execution. `None` means unlimited, except for
/// wall time where the container falls back to its configured default.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceAmounts {
    pub cpu_time_ms: Option<u64>,
    pub wall_time_ms: Option<u64>,
    pub memory_kb: Option<u64>,
    pub processes: Option<u64>,
    pub disk_io_kb: Option<u64>,
}

/// One execution sent to a container's init process.
///
/// Paths are interpreted inside the container root. The request is expected
/// to be validated by the caller; the container only forwards it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRequest {
    /// Echoed back by init so stale results can never be mistaken for this run
    pub id: String,
    /// argv; `command[0]` is resolved through `PATH`
    pub command: Vec<String>,
    pub environment: Vec<(String, String)>,
    pub workdir: PathBuf,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub limits: ResourceAmounts,
}

impl ExecutionRequest {
    pub fn new<S: Into<String>>(command: impl IntoIterator<Item = S>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            command: command.into_iter().map(Into::into).collect(),
            environment: vec![(
                "PATH".to_string(),
                "/usr/local/bin:/usr/bin:/bin".to_string(),
            )],
            workdir: PathBuf::from("/"),
            stdin: None,
            stdout: None,
            stderr: None,
            limits: ResourceAmounts::default(),
        }
    }

    pub fn with_limits(mut self, limits: ResourceAmounts) -> Self {
        self.limits = limits;
        self
    }
}

/// How the user program ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitInfo {
    Exited { code: i32 },
    Signaled { signal: i32 },
}

impl ExitInfo {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitInfo::Exited { code } => Some(*code),
            ExitInfo::Signaled { .. } => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            ExitInfo::Exited { .. } => None,
            ExitInfo::Signaled { signal } => Some(*signal),
        }
    }

    pub fn is_clean_exit(&self) -> bool {
        matches!(self, ExitInfo::Exited { code: 0 })
    }
}

/// Resource usage of one execution, in caller units.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceUsage {
    pub cpu_ms: u64,
    pub memory_kb: u64,
    pub disk_io_kb: u64,
    /// Peak number of concurrent user processes observed (init excluded)
    pub processes: u64,
    pub wall_ms: u64,
}

/// The single limit blamed for a termination.
///
/// Declaration order is the priority order used when several limits appear
/// exceeded within one polling interval: earlier variants win.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitViolation {
    CpuTime,
    Memory,
    Processes,
    DiskIo,
    WallTime,
}

/// Outcome summary, stable taxonomy shared with judge front-ends.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TerminationStatus {
    /// Exit code 0, no violation
    #[serde(rename = "OK")]
    Ok,
    /// Non-zero exit code, no violation
    #[serde(rename = "RE")]
    RuntimeError,
    /// Killed by a signal not attributable to a limit
    #[serde(rename = "SIG")]
    Signaled,
    /// CPU or wall time limit exceeded
    #[serde(rename = "TLE")]
    TimeLimit,
    #[serde(rename = "MLE")]
    MemoryLimit,
    #[serde(rename = "PLE")]
    ProcessLimit,
    /// Disk I/O budget exceeded
    #[serde(rename = "OLE")]
    OutputLimit,
}

/// Result of one `Container::execute` call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Termination {
    pub request_id: String,
    pub exit: ExitInfo,
    pub usage: ResourceUsage,
    pub violation: Option<LimitViolation>,
}

impl Termination {
    pub fn status(&self) -> TerminationStatus {
        match self.violation {
            Some(LimitViolation::CpuTime) | Some(LimitViolation::WallTime) => {
                TerminationStatus::TimeLimit
            }
            Some(LimitViolation::Memory) => TerminationStatus::MemoryLimit,
            Some(LimitViolation::Processes) => TerminationStatus::ProcessLimit,
            Some(LimitViolation::DiskIo) => TerminationStatus::OutputLimit,
            None => match self.exit {
                ExitInfo::Exited { code: 0 } => TerminationStatus::Ok,
                ExitInfo::Exited { .. } => TerminationStatus::RuntimeError,
                ExitInfo::Signaled { .. } => TerminationStatus::Signaled,
            },
        }
    }
}

/// Custom error types for sandcell
#[derive(Error, Debug)]
pub enum IsolateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Lock error: {0}")]
    Lock(String),

    /// Container construction failed; the instance was torn down.
    #[error("Container setup failed: {0}")]
    Setup(String),

    /// The container's init process is gone; discard and recreate it.
    #[error("Container is dead")]
    DeadContainer,

    /// The sandbox itself broke during an execution; the container is now dead.
    #[error("Internal sandbox fault: {0}")]
    InternalFault(String),
}

impl IsolateError {
    /// True when the error means the sandbox broke, as opposed to a usage or
    /// configuration mistake by the caller.
    pub fn is_sandbox_fault(&self) -> bool {
        matches!(
            self,
            IsolateError::Setup(_) | IsolateError::InternalFault(_) | IsolateError::Protocol(_)
        )
    }
}

impl From<nix::errno::Errno> for IsolateError {
    fn from(err: nix::errno::Errno) -> Self {
        IsolateError::Process(err.to_string())
    }
}

impl From<serde_json::Error> for IsolateError {
    fn from(err: serde_json::Error) -> Self {
        IsolateError::Protocol(err.to_string())
    }
}

/// Result type alias for sandcell operations
pub type Result<T> = std::result::Result<T, IsolateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_parse_defaults_to_same_path_read_only() {
        let binding = DirectoryBinding::parse("/usr").unwrap();
        assert_eq!(binding.source, PathBuf::from("/usr"));
        assert_eq!(binding.target, PathBuf::from("/usr"));
        assert_eq!(binding.permissions, DirectoryPermissions::ReadOnly);
        assert!(!binding.maybe);
    }

    #[test]
    fn test_binding_parse_with_options() {
        let binding = DirectoryBinding::parse("/srv/data=/data:rw,maybe").unwrap();
        assert_eq!(binding.source, PathBuf::from("/srv/data"));
        assert_eq!(binding.target, PathBuf::from("/data"));
        assert_eq!(binding.permissions, DirectoryPermissions::ReadWrite);
        assert!(binding.maybe);
        assert!(!binding.is_tmp);
    }

    #[test]
    fn test_binding_parse_rejects_bad_input() {
        assert!(DirectoryBinding::parse("/a=/b:bogus").is_err());
        assert!(DirectoryBinding::parse("/a=relative").is_err());
        assert!(DirectoryBinding::parse("/a=/b/../../etc").is_err());
        assert!(DirectoryBinding::parse("=/b").is_err());
    }

    #[test]
    fn test_violation_priority_order() {
        let mut seen = vec![
            LimitViolation::WallTime,
            LimitViolation::DiskIo,
            LimitViolation::Memory,
            LimitViolation::CpuTime,
            LimitViolation::Processes,
        ];
        seen.sort();
        assert_eq!(
            seen,
            vec![
                LimitViolation::CpuTime,
                LimitViolation::Memory,
                LimitViolation::Processes,
                LimitViolation::DiskIo,
                LimitViolation::WallTime,
            ]
        );
    }

    #[test]
    fn test_termination_status() {
        let mut termination = Termination {
            request_id: "r".to_string(),
            exit: ExitInfo::Exited { code: 42 },
            usage: ResourceUsage::default(),
            violation: None,
        };
        assert_eq!(termination.status(), TerminationStatus::RuntimeError);

        termination.exit = ExitInfo::Signaled { signal: 9 };
        assert_eq!(termination.status(), TerminationStatus::Signaled);

        termination.violation = Some(LimitViolation::WallTime);
        assert_eq!(termination.status(), TerminationStatus::TimeLimit);
    }

    #[test]
    fn test_termination_serializes_violation_names() {
        let termination = Termination {
            request_id: "r".to_string(),
            exit: ExitInfo::Signaled { signal: 9 },
            usage: ResourceUsage::default(),
            violation: Some(LimitViolation::CpuTime),
        };
        let json = serde_json::to_value(&termination).unwrap();
        assert_eq!(json["violation"], "CPU_TIME");
        assert_eq!(json["exit"]["kind"], "signaled");
        assert_eq!(json["exit"]["signal"], 9);
    }

    #[test]
    fn test_sandbox_fault_classification() {
        assert!(IsolateError::InternalFault("x".into()).is_sandbox_fault());
        assert!(IsolateError::Setup("x".into()).is_sandbox_fault());
        assert!(!IsolateError::DeadContainer.is_sandbox_fault());
        assert!(!IsolateError::Config("x".into()).is_sandbox_fault());
    }
}
