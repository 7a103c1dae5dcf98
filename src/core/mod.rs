//! Container runtime core.
//!
//! The host side ([`container`], [`monitor`]) drives a long-lived init
//! process ([`init`]) over the framed pipe [`protocol`].

pub mod container;
mod init;
pub mod monitor;
pub mod protocol;

pub use container::{Container, ContainerSpec, ContainerState};
