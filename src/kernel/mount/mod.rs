//! Filesystem isolation and mount management
//!
//! Builds the root a container's init chroots into.

pub mod filesystem;

pub use filesystem::ContainerRoot;
