/// Container root assembly: tmpfs root, bind mounts, /proc, /dev, chroot.
///
/// Everything here runs inside the init process, in its own mount namespace.
use crate::config::types::{DirectoryBinding, DirectoryPermissions, IsolateError, Result};
use nix::mount::{mount, MsFlags};
use std::fs;
use std::path::{Path, PathBuf};

const DEVICES: [&str; 4] = ["null", "zero", "random", "urandom"];

/// Filesystem view of one container
#[derive(Clone, Debug)]
pub struct ContainerRoot {
    root: PathBuf,
    bindings: Vec<DirectoryBinding>,
    strict_mode: bool,
}

impl ContainerRoot {
    pub fn new(root: PathBuf, bindings: Vec<DirectoryBinding>, strict_mode: bool) -> Self {
        Self {
            root,
            bindings,
            strict_mode,
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Host path of `target` inside the root.
    pub fn resolve(&self, target: &Path) -> PathBuf {
        self.root
            .join(target.strip_prefix("/").unwrap_or(target))
    }

    /// Build the root. Returns the warnings of steps skipped in permissive mode.
    pub fn prepare(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        mount_fs("tmpfs", &self.root, "tmpfs", MsFlags::MS_NOSUID | MsFlags::MS_NODEV, Some("mode=755"))?;

        for binding in &self.bindings {
            if let Err(e) = self.setup_single_binding(binding) {
                if self.strict_mode {
                    return Err(e);
                }
                warnings.push(e.to_string());
            }
        }

        let proc_path = self.resolve(Path::new("/proc"));
        create_dir(&proc_path)?;
        if let Err(e) = mount_fs(
            "proc",
            &proc_path,
            "proc",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None,
        ) {
            if self.strict_mode {
                return Err(e);
            }
            warnings.push(e.to_string());
        }

        if let Err(e) = self.bind_minimal_devices() {
            if self.strict_mode {
                return Err(e);
            }
            warnings.push(e.to_string());
        }

        Ok(warnings)
    }

    fn setup_single_binding(&self, binding: &DirectoryBinding) -> Result<()> {
        let target_path = self.resolve(&binding.target);

        if binding.is_tmp {
            create_dir(&target_path)?;
            let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
            if binding.permissions == DirectoryPermissions::NoExec {
                flags |= MsFlags::MS_NOEXEC;
            }
            return mount_fs("tmpfs", &target_path, "tmpfs", flags, Some("mode=1777"));
        }

        // Skip if source doesn't exist and maybe flag is set
        if !binding.source.exists() {
            if binding.maybe {
                return Ok(());
            }
            return Err(IsolateError::Filesystem(format!(
                "Binding source {} does not exist",
                binding.source.display()
            )));
        }

        if binding.source.is_dir() {
            create_dir(&target_path)?;
        } else {
            if let Some(parent) = target_path.parent() {
                create_dir(parent)?;
            }
            touch(&target_path)?;
        }

        let mut remount_flags =
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        match binding.permissions {
            DirectoryPermissions::ReadWrite => {}
            DirectoryPermissions::ReadOnly => remount_flags |= MsFlags::MS_RDONLY,
            DirectoryPermissions::NoExec => {
                remount_flags |= MsFlags::MS_RDONLY | MsFlags::MS_NOEXEC
            }
        }
        bind(&binding.source, &target_path, remount_flags)
    }

    fn bind_minimal_devices(&self) -> Result<()> {
        let dev_path = self.resolve(Path::new("/dev"));
        create_dir(&dev_path)?;
        for name in DEVICES {
            let host = Path::new("/dev").join(name);
            let target = dev_path.join(name);
            touch(&target)?;
            bind(&host, &target, MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_NOSUID)?;
        }
        Ok(())
    }

    /// chroot into the prepared root and move to its `/`.
    pub fn enter(&self) -> Result<()> {
        nix::unistd::chroot(&self.root).map_err(|e| {
            IsolateError::Filesystem(format!("chroot({}) failed: {}", self.root.display(), e))
        })?;
        std::env::set_current_dir("/").map_err(|e| {
            IsolateError::Filesystem(format!("Failed to change to chroot root: {}", e))
        })
    }
}

fn mount_fs(
    source: &str,
    target: &Path,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    mount(Some(source), target, Some(fstype), flags, data).map_err(|e| {
        IsolateError::Filesystem(format!(
            "Failed to mount {} on {}: {}",
            fstype,
            target.display(),
            e
        ))
    })
}

/// Bind `source` on `target`, then remount with `remount_flags`: a plain
/// bind ignores everything but MS_REC.
fn bind(source: &Path, target: &Path, remount_flags: MsFlags) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        IsolateError::Filesystem(format!(
            "Failed to bind mount {} to {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })?;

    mount(None::<&str>, target, None::<&str>, remount_flags, None::<&str>).map_err(|e| {
        IsolateError::Filesystem(format!(
            "Failed to restrict bind mount {}: {}",
            target.display(),
            e
        ))
    })
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| {
        IsolateError::Filesystem(format!("Failed to create {}: {}", path.display(), e))
    })
}

fn touch(path: &Path) -> Result<()> {
    fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map(|_| ())
        .map_err(|e| IsolateError::Filesystem(format!("Failed to create {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_stays_under_root() {
        let root = ContainerRoot::new(PathBuf::from("/tmp/sandcell/roots/sandcell-0"), Vec::new(), true);
        assert_eq!(
            root.resolve(Path::new("/usr/bin")),
            PathBuf::from("/tmp/sandcell/roots/sandcell-0/usr/bin")
        );
        assert_eq!(
            root.resolve(Path::new("work")),
            PathBuf::from("/tmp/sandcell/roots/sandcell-0/work")
        );
        assert_eq!(root.path(), Path::new("/tmp/sandcell/roots/sandcell-0"));
    }

    #[test]
    fn test_missing_required_binding_fails() {
        let base = std::env::temp_dir().join(format!("sandcell-root-{}", uuid::Uuid::new_v4()));
        let binding = DirectoryBinding::parse("/nonexistent/sandcell-source=/data").unwrap();
        let root = ContainerRoot::new(base.clone(), vec![binding.clone()], true);
        assert!(matches!(
            root.setup_single_binding(&binding),
            Err(IsolateError::Filesystem(_))
        ));

        let optional = DirectoryBinding::parse("/nonexistent/sandcell-source=/data:maybe").unwrap();
        assert!(root.setup_single_binding(&optional).is_ok());
        assert!(!base.exists());
    }
}
