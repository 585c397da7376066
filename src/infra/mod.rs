//! Infrastructure: filesystem spill storage and telemetry bootstrap.

pub mod spill;
pub mod telemetry;
