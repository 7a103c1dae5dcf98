//! sandcell: reusable, measured Linux process containers
//!
//! A [`Container`] pre-forks an init process inside fresh namespaces and a
//! dedicated cgroup, then runs untrusted programs in it one after another,
//! reporting for each how it ended and what it consumed.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::cgroup`]: Resource accounting and limits (v1/v2 backends, epochs)
//! - [`kernel::namespace`]: Namespace flags and in-namespace configuration
//! - [`kernel::mount`]: Container root construction
//! - [`kernel::rlimit`]: Static and per-execution rlimits
//! - [`kernel::signal`]: Shutdown flag and kill helpers
//!
//! ## Runtime Core ([`core`])
//! - [`core::container`]: Container lifecycle state machine
//! - [`core::monitor`]: Limit enforcement while a request runs
//! - [`core::protocol`]: Length-prefixed JSON frames between host and init
//!
//! ## Safety ([`safety`])
//! - [`safety::container_id`]: Host-unique container ids held by lock files
//!
//! ## Configuration ([`config`])
//! - [`config::settings`]: JSON configuration loading and validation
//! - [`config::types`]: Requests, results and error types
//!
//! # Example
//!
//! ```no_run
//! use sandcell::{Container, ContainerId, ContainerSpec, ExecutionRequest, SandboxConfig};
//!
//! let config = SandboxConfig::load_default()?;
//! let id = ContainerId::allocate(&config.container.lock_dir, config.container.max_containers)?;
//! let mut container = Container::new(id, ContainerSpec::from_config(&config)?)?;
//! let termination = container.execute(&ExecutionRequest::new(["/bin/true"]))?;
//! assert!(termination.exit.is_clean_exit());
//! container.reset()?;
//! # Ok::<(), sandcell::IsolateError>(())
//! ```

// Kernel Primitives
pub mod kernel;

// Runtime Core
pub mod core;

// Safety
pub mod safety;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the sandcell binary.
pub mod cli;

pub use crate::config::settings::SandboxConfig;
pub use crate::config::types::*;
pub use crate::core::{Container, ContainerSpec, ContainerState};
pub use crate::kernel::cgroup::Cgroup;
pub use crate::safety::ContainerId;
