//! Shared domain types for Conductor.
//!
//! This crate contains the core domain types used across the Conductor
//! workflow service: runs, checkpoints, schedules, leases, endpoints,
//! API keys, run events, workflow definitions, and the error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod apikey;
pub mod checkpoint;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod lease;
pub mod run;
pub mod schedule;
pub mod workflow;
