//! Domain types providing compile-time safety and self-documentation
//!
//! Newtype wrappers prevent common bugs like passing a counter index where a
//! core ID is expected, and make function signatures more expressive.

use serde::Serialize;
use std::fmt;

/// CPU core ID (0, 1, 2, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreId(pub u32);

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core {}", self.0)
    }
}

/// Hardware performance counter identity.
///
/// The three events the control loop brackets around the workload. Which
/// physical PMC backs each one is a [`crate::counters::CounterSource`]
/// implementation detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Last-level cache misses
    LlcMisses,
    /// Instructions retired
    InstructionsRetired,
    /// Unhalted core cycles
    CoreCycles,
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Counter::LlcMisses => write!(f, "llc-misses"),
            Counter::InstructionsRetired => write!(f, "instructions"),
            Counter::CoreCycles => write!(f, "core-cycles"),
        }
    }
}

/// One per-cycle telemetry record, produced by the control loop and consumed
/// exactly once by the statistics thread.
///
/// `ipc` is `NaN` when the cycle-counter delta was zero (degenerate sample,
/// recorded rather than raised).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Sample {
    /// Workload execution time in nanoseconds
    pub exec_time_ns: i64,
    /// Actual minus intended wake time in nanoseconds (signed)
    pub wakeup_jitter_ns: i64,
    /// LLC misses observed across the workload invocation
    pub cache_misses: i64,
    /// Instructions retired per unhalted core cycle
    pub ipc: f32,
}
