//! Domain model for rtpulse
//!
//! Core domain types and errors:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

pub use types::{CoreId, Counter, Sample};

pub use errors::{CounterError, WorkloadError};
