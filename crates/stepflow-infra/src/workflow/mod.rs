//! Workflow infrastructure: concrete operation handlers.
//!
//! - `http` -- outbound HTTP requests (`http.request` task)

pub mod http;
