//! The container's init process.
//!
//! Runs as PID 1 of the container's pid namespace. After one-time static
//! setup it serves execution requests from the command pipe, one at a time:
//! fork the program, wait for it, kill and reap everything else left in the
//! namespace, then report on the return pipe.
//!
//! Nothing in here logs. The process is a `clone()` of a possibly
//! multi-threaded host, so failures travel back as [`InitMessage`]s instead.

use crate::config::settings::RlimitSettings;
use crate::config::types::{ExecutionRequest, IsolateError, Result};
use crate::core::protocol::{read_frame, write_frame, InitMessage};
use crate::kernel::mount::ContainerRoot;
use crate::kernel::namespace::{self, NamespaceIsolation};
use crate::kernel::{rlimit, signal};
use crate::utils::fd_closure::close_inherited_fds;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, setpgid, ForkResult, Gid, Pid, Uid};
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Exit code of a forked child whose exec never happened.
const LAUNCH_FAILURE_EXIT: i32 = 127;

/// Everything init needs, prepared by the host before `clone()`.
///
/// Holds raw descriptors only: the host keeps owning its own copies, and
/// init adopts these after the clone.
pub(crate) struct InitContext {
    pub command_fd: RawFd,
    pub return_fd: RawFd,
    pub release_fd: RawFd,
    pub namespaces: NamespaceIsolation,
    pub hostname: String,
    pub root: Option<ContainerRoot>,
    pub rlimits: RlimitSettings,
    pub strict_mode: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Entry point of the cloned child. The return value is init's exit status.
pub(crate) fn init_main(ctx: &InitContext) -> isize {
    if close_inherited_fds(&[ctx.command_fd, ctx.return_fd, ctx.release_fd]).is_err() {
        return 1;
    }

    // SAFETY: the three descriptors were created for this process by the
    // host and every other copy in this address space was just closed.
    let (mut commands, mut results, mut release) = unsafe {
        (
            File::from_raw_fd(ctx.command_fd),
            File::from_raw_fd(ctx.return_fd),
            File::from_raw_fd(ctx.release_fd),
        )
    };

    // The host writes one byte once the cgroup and id maps are in place.
    // End of stream means the host gave up on us.
    let mut go = [0u8; 1];
    loop {
        match release.read(&mut go) {
            Ok(1) => break,
            Ok(_) => return 1,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return 1,
        }
    }
    drop(release);

    let ready = match static_setup(ctx) {
        Ok(warnings) => InitMessage::Ready { warnings },
        Err(e) => {
            let _ = write_frame(
                &mut results,
                &InitMessage::SetupFailed {
                    reason: e.to_string(),
                },
            );
            return 1;
        }
    };
    if write_frame(&mut results, &ready).is_err() {
        return 1;
    }

    serve(ctx, &mut commands, &mut results)
}

/// One-time setup. Returns the warnings of steps skipped in permissive mode.
fn static_setup(ctx: &InitContext) -> Result<Vec<String>> {
    let mut warnings = Vec::new();

    nix::unistd::setsid()
        .map_err(|e| IsolateError::Process(format!("setsid failed: {}", e)))?;
    nix::sys::prctl::set_pdeathsig(Signal::SIGKILL).map_err(|e| {
        IsolateError::Process(format!("Failed to set parent death signal: {}", e))
    })?;

    if let Some(root) = &ctx.root {
        namespace::harden_mount_propagation()?;
        warnings.extend(root.prepare()?);
        root.enter()?;
    }

    if let Err(e) = ctx.namespaces.configure_inside(&ctx.hostname) {
        if ctx.strict_mode {
            return Err(e);
        }
        warnings.push(e.to_string());
    }

    warnings.extend(rlimit::apply_static_limits(&ctx.rlimits, ctx.strict_mode)?);
    Ok(warnings)
}

fn serve(ctx: &InitContext, commands: &mut File, results: &mut File) -> isize {
    loop {
        let request: ExecutionRequest = match read_frame(commands) {
            Ok(Some(request)) => request,
            Ok(None) => return 0,
            Err(_) => return 2,
        };

        let report = run_request(ctx, &request);
        if write_frame(results, &report).is_err() {
            return 3;
        }
    }
}

/// argv/envp/program path converted before the fork so the child does not
/// allocate for them.
struct Launch {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl Launch {
    fn prepare(request: &ExecutionRequest) -> Result<Self> {
        let name = request
            .command
            .first()
            .ok_or_else(|| IsolateError::Config("Empty command".to_string()))?;

        let search_path = request
            .environment
            .iter()
            .find(|(key, _)| key == "PATH")
            .map(|(_, value)| value.as_str())
            .unwrap_or("/usr/local/bin:/usr/bin:/bin");
        let program = resolve_program(name, search_path, &request.workdir)
            .ok_or_else(|| IsolateError::Process(format!("{}: command not found", name)))?;

        let to_cstring = |s: &str| {
            CString::new(s)
                .map_err(|_| IsolateError::Config(format!("NUL byte in argument: {:?}", s)))
        };

        Ok(Self {
            program: CString::new(program.as_os_str().as_bytes()).map_err(|_| {
                IsolateError::Config(format!("NUL byte in program path: {:?}", program))
            })?,
            argv: request
                .command
                .iter()
                .map(|arg| to_cstring(arg))
                .collect::<Result<_>>()?,
            envp: request
                .environment
                .iter()
                .map(|(key, value)| to_cstring(&format!("{}={}", key, value)))
                .collect::<Result<_>>()?,
        })
    }
}

/// `execvp` semantics against the request's own `PATH`: names containing a
/// slash are used as given (relative to `workdir`), others are searched.
pub(crate) fn resolve_program(name: &str, search_path: &str, workdir: &Path) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains('/') {
        let path = Path::new(name);
        return Some(if path.is_absolute() {
            path.to_path_buf()
        } else {
            workdir.join(path)
        });
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn run_request(ctx: &InitContext, request: &ExecutionRequest) -> InitMessage {
    let launch_failed = |reason: String| InitMessage::LaunchFailed {
        request_id: request.id.clone(),
        reason,
    };

    let launch = match Launch::prepare(request) {
        Ok(launch) => launch,
        Err(e) => return launch_failed(e.to_string()),
    };

    // Carries the exec error back; CLOEXEC closes it on a successful exec.
    let (error_read, error_write) = match nix::unistd::pipe2(OFlag::O_CLOEXEC) {
        Ok(ends) => ends,
        Err(e) => return launch_failed(format!("pipe2 failed: {}", e)),
    };

    // SAFETY: init is single-threaded, so the child may run arbitrary code.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(error_read);
            exec_program(ctx, request, &launch, error_write)
        }
        Ok(ForkResult::Parent { child }) => {
            drop(error_write);
            // Both sides set the group so neither order of scheduling races
            let _ = setpgid(child, child);

            let mut exec_error = String::new();
            let _ = File::from(error_read).read_to_string(&mut exec_error);

            let (status, mut reaped) = wait_program(child);
            reaped += kill_and_reap(child);

            if !exec_error.is_empty() {
                return launch_failed(exec_error);
            }
            let (exit_code, signal) = match status {
                Some(WaitStatus::Exited(_, code)) => (Some(code), None),
                Some(WaitStatus::Signaled(_, sig, _)) => (None, Some(sig as i32)),
                _ => (None, Some(Signal::SIGKILL as i32)),
            };
            InitMessage::Finished {
                request_id: request.id.clone(),
                exit_code,
                signal,
                reaped_descendants: reaped,
            }
        }
        Err(e) => launch_failed(format!("fork failed: {}", e)),
    }
}

/// Runs in the forked child. Never returns: either exec succeeds or the
/// reason is written to `error_pipe` and the child exits.
fn exec_program(
    ctx: &InitContext,
    request: &ExecutionRequest,
    launch: &Launch,
    error_pipe: OwnedFd,
) -> ! {
    let error_fd = error_pipe.as_raw_fd();
    if let Err(e) = prepare_child(ctx, request, error_fd) {
        fail_launch(error_pipe, &e.to_string());
    }

    let err = nix::unistd::execve(&launch.program, &launch.argv, &launch.envp)
        .err()
        .unwrap_or(Errno::UnknownErrno);
    fail_launch(
        error_pipe,
        &format!("exec {}: {}", launch.program.to_string_lossy(), err),
    )
}

fn prepare_child(ctx: &InitContext, request: &ExecutionRequest, error_fd: RawFd) -> Result<()> {
    setpgid(Pid::from_raw(0), Pid::from_raw(0))
        .map_err(|e| IsolateError::Process(format!("setpgid failed: {}", e)))?;
    signal::reset_for_exec()?;

    std::env::set_current_dir(&request.workdir).map_err(|e| {
        IsolateError::Filesystem(format!(
            "Cannot enter working directory {}: {}",
            request.workdir.display(),
            e
        ))
    })?;

    redirect(request.stdin.as_deref(), libc::STDIN_FILENO, OFlag::O_RDONLY)?;
    let output_flags = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC;
    redirect(request.stdout.as_deref(), libc::STDOUT_FILENO, output_flags)?;
    redirect(request.stderr.as_deref(), libc::STDERR_FILENO, output_flags)?;

    drop_credentials(ctx.uid, ctx.gid)?;

    if let Some(cpu_ms) = request.limits.cpu_time_ms {
        rlimit::apply_cpu_limit(cpu_ms)?;
    }

    close_inherited_fds(&[error_fd])
}

/// Point `target` at `path`, or at /dev/null when no path was requested.
fn redirect(path: Option<&Path>, target: RawFd, flags: OFlag) -> Result<()> {
    let path = path.unwrap_or(Path::new("/dev/null"));
    let fd = nix::fcntl::open(path, flags | OFlag::O_CLOEXEC, Mode::from_bits_truncate(0o644))
        .map_err(|e| {
            IsolateError::Filesystem(format!("Cannot open {}: {}", path.display(), e))
        })?;
    // SAFETY: open just returned this descriptor and nobody else owns it.
    let opened = unsafe { OwnedFd::from_raw_fd(fd) };
    // SAFETY: dup2 onto a standard descriptor of this single-threaded child.
    if unsafe { libc::dup2(opened.as_raw_fd(), target) } < 0 {
        return Err(IsolateError::Filesystem(format!(
            "dup2 onto fd {} failed: {}",
            target,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn drop_credentials(uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    if let Some(gid) = gid {
        let gid = Gid::from_raw(gid);
        // Not permitted inside an unprivileged user namespace; setresgid is
        // what matters
        let _ = nix::unistd::setgroups(&[gid]);
        nix::unistd::setresgid(gid, gid, gid)
            .map_err(|e| IsolateError::Process(format!("setresgid({}) failed: {}", gid, e)))?;
    }
    if let Some(uid) = uid {
        let uid = Uid::from_raw(uid);
        nix::unistd::setresuid(uid, uid, uid)
            .map_err(|e| IsolateError::Process(format!("setresuid({}) failed: {}", uid, e)))?;
    }
    Ok(())
}

fn fail_launch(error_pipe: OwnedFd, reason: &str) -> ! {
    let mut pipe = File::from(error_pipe);
    let _ = pipe.write_all(reason.as_bytes());
    drop(pipe);
    // SAFETY: _exit skips atexit handlers and stdio flushing that belong to
    // the parent's copy of this address space.
    unsafe { libc::_exit(LAUNCH_FAILURE_EXIT) }
}

/// Wait for the program while reaping orphans reparented to init, so they do
/// not pile up as zombies against the process limit. Returns the program's
/// status and how many other processes were reaped.
fn wait_program(child: Pid) -> (Option<WaitStatus>, u32) {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(status @ WaitStatus::Exited(pid, _)) | Ok(status @ WaitStatus::Signaled(pid, _, _))
                if pid == child =>
            {
                return (Some(status), reaped)
            }
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => reaped += 1,
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => return (None, reaped),
        }
    }
}

/// SIGKILL whatever the program left behind and reap it all. As namespace
/// init `kill(-1)` reaches exactly the rest of the namespace; otherwise the
/// program's process group is the best available scope.
fn kill_and_reap(child: Pid) -> u32 {
    // Failures are ignored: init cannot log, and the reap loop below ends
    // once nothing is left either way
    let target = if std::process::id() == 1 {
        -1
    } else {
        -child.as_raw()
    };
    let _ = signal::send_signal(target, Signal::SIGKILL);

    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => reaped += 1,
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => return reaped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_program_searches_path() {
        let resolved = resolve_program("sh", "/nonexistent:/bin:/usr/bin", Path::new("/"));
        let resolved = resolved.unwrap();
        assert!(resolved.ends_with("sh"));
        assert!(is_executable(&resolved));
    }

    #[test]
    fn test_resolve_program_with_slash_skips_search() {
        assert_eq!(
            resolve_program("./run.sh", "/bin", Path::new("/work")),
            Some(PathBuf::from("/work/./run.sh"))
        );
        assert_eq!(
            resolve_program("/opt/tool", "/bin", Path::new("/work")),
            Some(PathBuf::from("/opt/tool"))
        );
    }

    #[test]
    fn test_resolve_program_missing() {
        assert_eq!(resolve_program("sandcell-no-such-tool", "/bin:/usr/bin", Path::new("/")), None);
        assert_eq!(resolve_program("", "/bin", Path::new("/")), None);
    }

    #[test]
    fn test_launch_prepare_rejects_empty_command() {
        let request = ExecutionRequest::new(Vec::<String>::new());
        assert!(matches!(Launch::prepare(&request), Err(IsolateError::Config(_))));
    }

    #[test]
    fn test_launch_prepare_builds_env_pairs() {
        let mut request = ExecutionRequest::new(["sh", "-c", "true"]);
        request.environment.push(("LANG".to_string(), "C".to_string()));
        let launch = Launch::prepare(&request).unwrap();
        assert_eq!(launch.argv.len(), 3);
        assert!(launch
            .envp
            .iter()
            .any(|entry| entry.to_str() == Ok("LANG=C")));
    }
}
