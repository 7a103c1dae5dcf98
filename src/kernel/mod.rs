//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: signal -> namespace -> rlimit -> mount -> cgroup

pub mod cgroup;
pub mod mount;
pub mod namespace;
pub mod rlimit;
pub mod signal;
