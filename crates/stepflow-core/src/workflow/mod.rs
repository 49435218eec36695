//! Workflow engine core: graph compilation, step execution and scheduling.
//!
//! - `graph` -- definition validation and compiled, per-scope state graphs
//! - `cache` -- compiled graphs by `(workflow id, version)`
//! - `expression` -- sandboxed JEXL evaluator with existence primitives
//! - `context` -- dotted-path access, `${ }` resolution, size limits
//! - `operation` -- task handler registry (external operation executors)
//! - `retry` -- attempt accounting and exponential backoff
//! - `executor` -- one strategy per state kind, recursive sub-graphs
//! - `scheduler` -- durable-queue consumer loop and startup recovery
//! - `notifier` -- approval notification port

pub mod cache;
pub mod context;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod notifier;
pub mod operation;
pub mod retry;
pub mod scheduler;
