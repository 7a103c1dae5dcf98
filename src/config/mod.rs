//! Configuration and shared types
//!
//! `settings` loads `sandcell.json`; `types` holds the request/result model
//! and the error taxonomy.

pub mod settings;
pub mod types;
