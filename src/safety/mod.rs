//! Safety and cleanup
//!
//! Host-unique identities for containers, held for the container's lifetime.

pub mod container_id;

pub use container_id::{ContainerId, LockInfo};
