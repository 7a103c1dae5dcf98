//! Host side of a reusable container.
//!
//! A [`Container`] owns one long-lived init process inside fresh namespaces,
//! the cgroup that accounts for it, the two protocol pipes and the on-disk
//! root. Requests run one at a time; between runs the caller starts a new
//! accounting epoch with [`Container::reset`].

use crate::config::settings::{CgroupSettings, RlimitSettings, SandboxConfig};
use crate::config::types::{
    DirectoryBinding, ExecutionRequest, IsolateError, ResourceAmounts, Result, Termination,
};
use crate::core::init::{init_main, InitContext};
use crate::core::monitor::wait_readable;
use crate::core::protocol::{write_frame, FrameReader, InitMessage};
use crate::kernel::cgroup::Cgroup;
use crate::kernel::mount::ContainerRoot;
use crate::kernel::namespace::{self, NamespaceIsolation};
use crate::kernel::signal;
use crate::safety::ContainerId;
use nix::errno::Errno;
use nix::sched::clone;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

const INIT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Everything needed to build containers, resolved from [`SandboxConfig`].
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub root_dir: PathBuf,
    pub namespaces: NamespaceIsolation,
    pub hostname: String,
    pub bindings: Vec<DirectoryBinding>,
    pub rlimits: RlimitSettings,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub strict_mode: bool,
    pub cgroup: CgroupSettings,
    pub poll_interval: Duration,
    pub kill_grace: Duration,
    pub setup_timeout: Duration,
    pub default_wall_time: Duration,
}

impl ContainerSpec {
    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        config.validate()?;
        let container = &config.container;
        Ok(Self {
            root_dir: container.root_dir.clone(),
            namespaces: NamespaceIsolation::new(
                container.mount_namespace,
                container.network_namespace,
                container.user_namespace,
            ),
            hostname: container.hostname.clone(),
            bindings: config.bindings()?,
            rlimits: config.rlimits.clone(),
            uid: container.uid,
            gid: container.gid,
            strict_mode: container.strict_mode,
            cgroup: config.cgroup.clone(),
            poll_interval: config.monitor.poll_interval(),
            kill_grace: config.monitor.kill_grace(),
            setup_timeout: config.monitor.setup_timeout(),
            default_wall_time: config.monitor.default_wall_time(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Init cloned, static setup not confirmed yet.
    Created,
    /// Waiting for a request.
    Idle,
    /// A request is in flight.
    Running,
    /// Init is gone or the protocol broke. Only dropping is left.
    Dead,
}

/// The init process as seen from the host. Killed and reaped on drop.
#[derive(Debug)]
struct InitProcess {
    pid: Pid,
    reaped: bool,
}

impl InitProcess {
    /// Non-blocking reap. True once init is gone.
    fn try_reap(&mut self) -> bool {
        if self.reaped {
            return true;
        }
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    self.reaped = true;
                    return true;
                }
                Ok(_) => return false,
                Err(Errno::EINTR) => continue,
                // Someone else reaped it already
                Err(Errno::ECHILD) => {
                    self.reaped = true;
                    return true;
                }
                Err(e) => {
                    log::warn!("waitpid({}) failed: {}", self.pid, e);
                    return false;
                }
            }
        }
    }

    fn kill(&self) {
        if !self.reaped {
            signal::kill_process(self.pid.as_raw(), Signal::SIGKILL);
        }
    }

    fn kill_and_wait(&mut self) {
        if self.reaped {
            return;
        }
        self.kill();
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        self.reaped = true;
    }
}

impl Drop for InitProcess {
    fn drop(&mut self) {
        self.kill_and_wait();
    }
}

/// The container's root directory on the host. Removed on drop; the mounts
/// inside it lived in init's mount namespace and are gone with it.
#[derive(Debug)]
struct RootDir(PathBuf);

impl RootDir {
    fn create(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path).map_err(|e| {
            IsolateError::Filesystem(format!(
                "Cannot create container root {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self(path))
    }
}

impl Drop for RootDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", self.0.display(), e);
            }
        }
    }
}

/// A pre-forked sandbox that runs requests one after another.
///
/// Fields drop in declaration order: init is killed and reaped first, so the
/// cgroup and root directory are empty by the time they are removed, and
/// the id lock is released last.
pub struct Container {
    init: InitProcess,
    _root: RootDir,
    pub(crate) cgroup: Cgroup,
    command_pipe: File,
    pub(crate) return_pipe: File,
    pub(crate) frames: FrameReader,
    pub(crate) state: ContainerState,
    pub(crate) spec: ContainerSpec,
    id: ContainerId,
}

impl Container {
    /// Clone the init process, put it in its cgroup and wait for it to finish
    /// static setup. Any failure here is a sandbox setup fault.
    pub fn new(id: ContainerId, spec: ContainerSpec) -> Result<Self> {
        Self::build(id, spec).map_err(|e| match e {
            IsolateError::Setup(_) => e,
            other => IsolateError::Setup(other.to_string()),
        })
    }

    fn build(id: ContainerId, spec: ContainerSpec) -> Result<Self> {
        let root = RootDir::create(spec.root_dir.join(id.name()))?;

        let (command_read, command_write) = cloexec_pipe()?;
        let (return_read, return_write) = cloexec_pipe()?;
        let (release_read, release_write) = cloexec_pipe()?;

        let context = InitContext {
            command_fd: command_read.as_raw_fd(),
            return_fd: return_write.as_raw_fd(),
            release_fd: release_read.as_raw_fd(),
            namespaces: spec.namespaces,
            hostname: spec.hostname.clone(),
            root: spec.namespaces.mount().then(|| {
                ContainerRoot::new(root.0.clone(), spec.bindings.clone(), spec.strict_mode)
            }),
            rlimits: spec.rlimits.clone(),
            strict_mode: spec.strict_mode,
            uid: spec.uid,
            gid: spec.gid,
        };

        let mut stack = vec![0u8; INIT_STACK_SIZE];
        let callback: Box<dyn FnMut() -> isize> = Box::new(move || init_main(&context));
        // SAFETY: the child runs on its own stack with a copy of this address
        // space and only touches `context`, which holds plain data and raw
        // descriptors. It never returns into this stack frame.
        let pid = unsafe {
            clone(
                callback,
                &mut stack,
                spec.namespaces.clone_flags(),
                Some(libc::SIGCHLD),
            )
        }
        .map_err(|e| IsolateError::Namespace(format!("clone(init) failed: {}", e)))?;
        let init = InitProcess { pid, reaped: false };

        drop(command_read);
        drop(return_write);
        drop(release_read);

        if spec.namespaces.user() {
            namespace::write_id_maps(pid.as_raw())?;
        }
        let return_pipe = File::from(return_read);
        set_nonblocking(&return_pipe)?;

        let cgroup = Cgroup::make_for(pid.as_raw() as u32, &id.name(), &spec.cgroup)?;

        // From here on the container's own drop order tears everything down
        let mut container = Self {
            init,
            _root: root,
            cgroup,
            command_pipe: File::from(command_write),
            return_pipe,
            frames: FrameReader::new(),
            state: ContainerState::Created,
            spec,
            id,
        };

        let mut release = File::from(release_write);
        release.write_all(&[1])?;
        drop(release);

        container.wait_ready()?;
        container.cgroup.reset()?;
        container.state = ContainerState::Idle;
        log::info!(
            "Container {} ready: init pid {}, cgroup {}, namespaces {:?}",
            container.id.name(),
            container.init.pid,
            container.cgroup.backend_name(),
            container.spec.namespaces.get_enabled_namespaces()
        );
        Ok(container)
    }

    fn wait_ready(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.spec.setup_timeout;
        loop {
            let fill = self.frames.fill_from(&mut self.return_pipe)?;
            match self.frames.next_frame::<InitMessage>()? {
                Some(InitMessage::Ready { warnings }) => {
                    for warning in warnings {
                        log::warn!("Container {}: {}", self.id.name(), warning);
                    }
                    return Ok(());
                }
                Some(InitMessage::SetupFailed { reason }) => {
                    return Err(IsolateError::Setup(format!("init setup failed: {}", reason)));
                }
                Some(other) => {
                    return Err(IsolateError::Protocol(format!(
                        "expected ready message, got {:?}",
                        other
                    )));
                }
                None => {}
            }
            if fill.eof {
                self.kill_init();
                return Err(IsolateError::Setup(
                    "init exited before finishing setup".to_string(),
                ));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(IsolateError::Setup(format!(
                    "init did not finish setup within {:?}",
                    self.spec.setup_timeout
                )));
            }
            wait_readable(&self.return_pipe, deadline - now);
        }
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn init_pid(&self) -> i32 {
        self.init.pid.as_raw()
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn cgroup(&self) -> &Cgroup {
        &self.cgroup
    }

    /// Run `request` to completion under its limits.
    ///
    /// Limit breaches are reported in the returned [`Termination`], not as
    /// errors. A program that cannot be started yields
    /// [`IsolateError::Process`] and leaves the container usable.
    pub fn execute(&mut self, request: &ExecutionRequest) -> Result<Termination> {
        if self.is_dead() {
            return Err(IsolateError::DeadContainer);
        }
        if self.state != ContainerState::Idle {
            return Err(IsolateError::Process(format!(
                "Container {} is {:?}, not idle",
                self.id.name(),
                self.state
            )));
        }
        if request.command.is_empty() {
            return Err(IsolateError::Config("Empty command".to_string()));
        }
        check_limits(&request.limits)?;

        let limits = &request.limits;
        match limits.memory_kb {
            Some(kb) => self.cgroup.set_memory_limit(kb)?,
            None => self.cgroup.clear_memory_limit()?,
        }
        // Init itself is a member of the cgroup
        match limits.processes {
            Some(n) => self.cgroup.set_process_limit(n.saturating_add(1))?,
            None => self.cgroup.clear_process_limit()?,
        }

        if let Err(e) = write_frame(&mut self.command_pipe, request) {
            self.state = ContainerState::Dead;
            return Err(IsolateError::InternalFault(format!(
                "Cannot hand request {} to init: {}",
                request.id, e
            )));
        }

        log::debug!("Container {} running request {}", self.id.name(), request.id);
        self.state = ContainerState::Running;
        self.monitor_init(request)
    }

    /// True once init is gone or the container was marked dead. Sticky.
    pub fn is_dead(&mut self) -> bool {
        if self.state == ContainerState::Dead {
            return true;
        }
        if self.init.try_reap() {
            log::warn!("Init of container {} exited", self.id.name());
            self.state = ContainerState::Dead;
        }
        self.state == ContainerState::Dead
    }

    /// Start a fresh accounting epoch. Anything init wrote after the last
    /// request finished is discarded.
    pub fn reset(&mut self) -> Result<()> {
        if self.is_dead() {
            return Err(IsolateError::DeadContainer);
        }
        if self.state != ContainerState::Idle {
            return Err(IsolateError::Process(format!(
                "Cannot reset container {} while {:?}",
                self.id.name(),
                self.state
            )));
        }
        let fill = self.frames.fill_from(&mut self.return_pipe)?;
        self.frames.clear();
        if fill.eof {
            self.state = ContainerState::Dead;
            return Err(IsolateError::DeadContainer);
        }
        self.cgroup.reset()?;
        self.state = ContainerState::Idle;
        Ok(())
    }

    /// Kill init and mark the container dead.
    pub(crate) fn kill_init(&mut self) {
        self.init.kill_and_wait();
        self.state = ContainerState::Dead;
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.state != ContainerState::Dead {
            if let Err(e) = self.cgroup.kill_all() {
                log::warn!("Failed to kill members of {}: {}", self.cgroup.name(), e);
            }
        }
        self.init.kill_and_wait();
        log::debug!("Container {} destroyed", self.id.name());
    }
}

/// Reject limits the program could never run under. A process limit of zero
/// would make the kernel refuse the fork of the program itself.
fn check_limits(limits: &ResourceAmounts) -> Result<()> {
    if limits.processes == Some(0) {
        return Err(IsolateError::Config(
            "Process limit must allow at least the program itself".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    // SAFETY: pipe2 fills `fds` with two new descriptors on success.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(IsolateError::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

pub(crate) fn set_nonblocking(file: &File) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(file.as_raw_fd(), FcntlArg::F_GETFL)?;
    fcntl(
        file.as_raw_fd(),
        FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_default_config() {
        let spec = ContainerSpec::from_config(&SandboxConfig::default()).unwrap();
        assert!(spec.namespaces.mount());
        assert!(spec.namespaces.network());
        assert!(!spec.namespaces.user());
        assert_eq!(spec.hostname, "sandcell");
        assert!(spec.bindings.iter().any(|b| b.is_tmp));
        assert_eq!(spec.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_spec_rejects_invalid_config() {
        let mut config = SandboxConfig::default();
        config.monitor.poll_interval_ms = 0;
        assert!(matches!(
            ContainerSpec::from_config(&config),
            Err(IsolateError::Config(_))
        ));
    }

    #[test]
    fn test_cloexec_pipe_carries_bytes() {
        let (read, write) = cloexec_pipe().unwrap();
        let mut writer = File::from(write);
        writer.write_all(b"x").unwrap();
        drop(writer);

        let mut reader = File::from(read);
        set_nonblocking(&reader).unwrap();
        let mut frames = FrameReader::new();
        let fill = frames.fill_from(&mut reader).unwrap();
        assert_eq!(fill.bytes, 1);
        assert!(fill.eof);
    }

    #[test]
    fn test_zero_process_limit_is_rejected() {
        let zero = ResourceAmounts {
            processes: Some(0),
            ..ResourceAmounts::default()
        };
        assert!(matches!(check_limits(&zero), Err(IsolateError::Config(_))));

        let one = ResourceAmounts {
            processes: Some(1),
            ..ResourceAmounts::default()
        };
        assert!(check_limits(&one).is_ok());
        assert!(check_limits(&ResourceAmounts::default()).is_ok());
    }

    #[test]
    fn test_root_dir_removed_on_drop() {
        let path = std::env::temp_dir().join(format!("sandcell-root-{}", uuid::Uuid::new_v4()));
        let root = RootDir::create(path.clone()).unwrap();
        assert!(path.is_dir());
        drop(root);
        assert!(!path.exists());
    }
}
