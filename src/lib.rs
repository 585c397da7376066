//! Riserva keeps in-flight models in a bounded, access-ordered holding
//! area until the hosting service is ready to persist them.
//!
//! The service trains classifier models on request and keeps the freshly
//! trained objects in memory while callers are still touching them. Memory
//! is bounded: when an insert pushes the holding area over capacity, the
//! least-recently-touched entry is evicted and, if it carries a durable
//! handle, spilled back to disk through a persistence sink.
//!
//! - [`cache`]: the access-ordered store, its logical clock, and the
//!   persistence-sink interface.
//! - [`config`]: typed settings with layered precedence (file, then environment).
//! - [`infra`]: filesystem spill storage and telemetry bootstrap.

pub mod cache;
pub mod config;
pub mod infra;
