//! idtable-configs
//!
//! Configuration types and loader for the idtable identity store.

pub mod config;
pub mod file_helpers;

pub use config::defaults;
pub use config::*;
