//! Observability setup for Stepflow: tracing subscriber initialisation with
//! optional OpenTelemetry export.

pub mod tracing_setup;
