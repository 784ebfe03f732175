//! Structured error types for rtpulse
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::CoreId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("workload buffer holds {nodes} cache-line nodes, need at least {min}")]
    BufferTooSmall { nodes: usize, min: usize },
}

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("failed to open {path}: {source}")]
    MsrOpen { path: String, source: std::io::Error },

    #[error("cannot read MSR {msr:#x} on {core}")]
    MsrRead { msr: u64, core: CoreId },

    #[error("cannot write MSR {msr:#x} on {core}")]
    MsrWrite { msr: u64, core: CoreId },

    #[error("cannot classify core type of hybrid platform (CPUID leaf 0x1A)")]
    UnknownCoreType,

    #[error("failed to enable ring-3 rdpmc via {path}: {source}")]
    RdpmcEnable { path: String, source: std::io::Error },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
