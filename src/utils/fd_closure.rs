//! File descriptor hygiene for the init process and the programs it starts.
//!
//! Prefers close_range(2) and falls back to iterating /proc/self/fd. Nothing
//! here logs: it runs in freshly cloned or forked children.

use crate::config::types::{IsolateError, Result};
use std::fs;
use std::os::unix::io::RawFd;

/// Close every descriptor above stderr except those in `keep`.
pub fn close_inherited_fds(keep: &[RawFd]) -> Result<()> {
    let mut keep: Vec<RawFd> = keep.iter().copied().filter(|fd| *fd > 2).collect();
    keep.sort_unstable();
    keep.dedup();

    if try_close_range(&keep) {
        return Ok(());
    }
    close_fds_via_proc(&keep)
}

/// Gaps between kept descriptors, as inclusive ranges starting at 3.
fn ranges_to_close(keep: &[RawFd]) -> Vec<(u32, u32)> {
    let mut ranges = Vec::with_capacity(keep.len() + 1);
    let mut first: u32 = 3;
    for fd in keep {
        let fd = *fd as u32;
        if fd > first {
            ranges.push((first, fd - 1));
        }
        first = fd + 1;
    }
    ranges.push((first, u32::MAX));
    ranges
}

fn try_close_range(keep: &[RawFd]) -> bool {
    ranges_to_close(keep).into_iter().all(|(first, last)| {
        // SAFETY: close_range only affects this process's descriptor table.
        let rc = unsafe { libc::syscall(libc::SYS_close_range, first, last, 0u32) };
        rc == 0
    })
}

fn close_fds_via_proc(keep: &[RawFd]) -> Result<()> {
    let fd_dir = "/proc/self/fd";

    // Collect first: the directory handle is itself one of the descriptors
    let fds = get_open_fds()?;
    let mut failed_closes = Vec::new();
    for fd in fds.into_iter().filter(|fd| *fd > 2 && !keep.contains(fd)) {
        // SAFETY: fd was open a moment ago and nothing else in this
        // single-threaded child holds it.
        if unsafe { libc::close(fd) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EBADF) {
                failed_closes.push(format!("fd {}: {}", fd, err));
            }
        }
    }

    if !failed_closes.is_empty() {
        return Err(IsolateError::Filesystem(format!(
            "Failed to close {} FD(s) listed in {}: {}",
            failed_closes.len(),
            fd_dir,
            failed_closes.join(", ")
        )));
    }
    Ok(())
}

/// Get list of open file descriptors
pub fn get_open_fds() -> Result<Vec<i32>> {
    let fd_dir = "/proc/self/fd";

    let entries = fs::read_dir(fd_dir)
        .map_err(|e| IsolateError::Filesystem(format!("Failed to read {}: {}", fd_dir, e)))?;

    let mut fds: Vec<i32> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse::<i32>().ok())
        .collect();

    fds.sort();
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_open_fds() {
        let fds = get_open_fds().unwrap();
        // Should at least have stdin, stdout, stderr
        assert!(fds.len() >= 3);
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
        assert!(fds.contains(&2));
    }

    #[test]
    fn test_ranges_skip_kept_descriptors() {
        assert_eq!(ranges_to_close(&[]), vec![(3, u32::MAX)]);
        assert_eq!(ranges_to_close(&[5, 6]), vec![(3, 4), (7, u32::MAX)]);
        assert_eq!(ranges_to_close(&[3]), vec![(4, u32::MAX)]);
        assert_eq!(ranges_to_close(&[4, 9]), vec![(3, 3), (5, 8), (10, u32::MAX)]);
    }
}
