//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepflow-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod approval;
pub mod queue;
pub mod workflow;

#[cfg(test)]
pub(crate) mod memory;
