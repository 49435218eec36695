//! Shared domain types for Stepflow.
//!
//! This crate contains the domain types used across the workflow engine:
//! definitions, runs, step records, work items, approvals, configuration and
//! the error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod approval;
pub mod config;
pub mod error;
pub mod run;
pub mod workflow;
