/// Namespace isolation for containers
///
/// PID, IPC and UTS namespaces are always created; mount, network and user
/// namespaces are optional.
use crate::config::types::{IsolateError, Result};

use nix::sched::CloneFlags;
use nix::unistd::sethostname;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Namespace isolation controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceIsolation {
    enable_mount_namespace: bool,
    enable_network_namespace: bool,
    enable_user_namespace: bool,
}

impl NamespaceIsolation {
    pub fn new(enable_mount: bool, enable_network: bool, enable_user: bool) -> Self {
        Self {
            enable_mount_namespace: enable_mount,
            enable_network_namespace: enable_network,
            enable_user_namespace: enable_user,
        }
    }

    /// Check if namespace isolation is supported on this system
    pub fn is_supported() -> bool {
        std::fs::read_dir("/proc/self/ns").is_ok()
    }

    /// Namespace kinds this kernel exposes under `/proc/self/ns`.
    pub fn available_namespaces() -> Vec<String> {
        let mut found: Vec<String> = std::fs::read_dir("/proc/self/ns")
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        found.sort();
        found
    }

    pub fn mount(&self) -> bool {
        self.enable_mount_namespace
    }

    pub fn network(&self) -> bool {
        self.enable_network_namespace
    }

    pub fn user(&self) -> bool {
        self.enable_user_namespace
    }

    /// Flags for the `clone()` that creates a container's init process.
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWUTS;
        if self.enable_mount_namespace {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.enable_network_namespace {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.enable_user_namespace {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        flags
    }

    pub fn get_enabled_namespaces(&self) -> Vec<&'static str> {
        let mut namespaces = vec!["PID", "IPC", "UTS"];
        if self.enable_mount_namespace {
            namespaces.push("Mount");
        }
        if self.enable_network_namespace {
            namespaces.push("Network");
        }
        if self.enable_user_namespace {
            namespaces.push("User");
        }
        namespaces
    }

    /// Runs inside the new namespaces: hostname and loopback.
    pub fn configure_inside(&self, hostname: &str) -> Result<()> {
        sethostname(hostname).map_err(|e| {
            IsolateError::Namespace(format!("Failed to set hostname in UTS namespace: {}", e))
        })?;

        if self.enable_network_namespace {
            bring_up_loopback()?;
        }
        Ok(())
    }
}

fn bring_up_loopback() -> Result<()> {
    // SAFETY: plain socket(2); ownership of the descriptor moves into OwnedFd.
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(IsolateError::Namespace(format!(
            "Failed to open socket for loopback setup: {}",
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: raw is a fresh descriptor nobody else owns.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: ifreq is plain old data; all-zero is a valid value.
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (idx, b) in b"lo\0".iter().enumerate() {
        ifr.ifr_name[idx] = *b as libc::c_char;
    }

    // SAFETY: SIOCGIFFLAGS reads into the ifreq we own.
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut ifr) } != 0 {
        return Err(IsolateError::Namespace(format!(
            "Failed to query loopback flags: {}",
            std::io::Error::last_os_error()
        )));
    }

    // SAFETY: the kernel filled ifru_flags for SIOCGIFFLAGS.
    let current_flags = unsafe { ifr.ifr_ifru.ifru_flags } as libc::c_int;
    ifr.ifr_ifru.ifru_flags = (current_flags | libc::IFF_UP) as libc::c_short;

    // SAFETY: SIOCSIFFLAGS only reads the ifreq.
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as _, &ifr) } != 0 {
        return Err(IsolateError::Namespace(format!(
            "Failed to bring up loopback interface: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// mount(NULL, "/", NULL, MS_REC | MS_PRIVATE, NULL)
///
/// Must succeed before any other mount in a new mount namespace, otherwise
/// the container's mounts would propagate to the host.
pub fn harden_mount_propagation() -> Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        IsolateError::Namespace(format!(
            "Failed to harden mount propagation (MS_PRIVATE|MS_REC on /): {}",
            e
        ))
    })
}

/// Map root inside the user namespace of `pid` to the caller's effective
/// uid/gid. Runs on the host before the child is released.
pub fn write_id_maps(pid: i32) -> Result<()> {
    let uid = nix::unistd::geteuid();
    let gid = nix::unistd::getegid();
    let proc_dir = std::path::PathBuf::from(format!("/proc/{}", pid));

    let write = |file: &str, content: String| {
        std::fs::write(proc_dir.join(file), content).map_err(|e| {
            IsolateError::Namespace(format!("Failed to write /proc/{}/{}: {}", pid, file, e))
        })
    };

    // setgroups must be denied before an unprivileged gid_map write
    match std::fs::write(proc_dir.join("setgroups"), "deny") {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(IsolateError::Namespace(format!(
                "Failed to write /proc/{}/setgroups: {}",
                pid, e
            )))
        }
    }
    write("uid_map", format!("0 {} 1\n", uid))?;
    write("gid_map", format!("0 {} 1\n", gid))?;
    Ok(())
}
