//! REST API endpoint handlers.

pub mod approval;
pub mod health;
pub mod run;
pub mod workflow;
