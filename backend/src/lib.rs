//! idtable-admin library
//!
//! Exposes the admin binary's modules for integration testing.

pub mod args;
pub mod commands;
pub mod lifecycle;
pub mod logging;
