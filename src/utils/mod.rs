//! Utilities
//!
//! Descriptor hygiene shared by the init process and its children.

pub mod fd_closure;
