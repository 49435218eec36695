//! Workflow engine logic and repository trait definitions for Stepflow.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements. It depends only on `stepflow-types` -- never on
//! `stepflow-infra` or any database/IO crate.

pub mod repository;
pub mod service;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
