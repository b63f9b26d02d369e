//! Observability setup for Conductor.

pub mod tracing_setup;
