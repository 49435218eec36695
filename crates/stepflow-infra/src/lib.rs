//! Infrastructure layer for Stepflow.
//!
//! Contains implementations of the ports defined in `stepflow-core`: SQLite
//! repositories and work queue, the outbound webhook notifier, concrete
//! operation handlers, and the `config.toml` loader.

pub mod config;
pub mod notifier;
pub mod sqlite;
pub mod workflow;
