//! # rtpulse - Periodic Real-Time Workload Monitor
//!
//! rtpulse runs a cache-sensitive pointer-chasing workload on a fixed
//! period, measures each cycle with hardware performance counters, and
//! streams the per-cycle telemetry off the real-time path through a
//! lock-free queue.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────┐      ┌──────────────────────────────┐
//! │   Control Thread (RT core)   │      │  Statistics Thread (core N)  │
//! │                              │      │                              │
//! │  sleep to absolute deadline  │      │   poll queue, batch samples  │
//! │  read counters ─ workload ─  │      │   running min/max/avg or     │
//! │  read counters               │      │   JSON batches               │
//! │        │                     │      │        ▲                     │
//! │        ▼                     │      │        │                     │
//! │   Sample {exec, jitter,      │      │        │                     │
//! │           misses, ipc}       │      │        │                     │
//! └────────┼─────────────────────┘      └────────┼─────────────────────┘
//!          │     lock-free Michael–Scott FIFO    │
//!          └──────────────►  SampleQueue  ───────┘
//!                 (epoch-based node reclamation)
//! ```
//!
//! ## Module Structure
//!
//! - [`workload`]: cache-line-granular cyclic pointer graph; sequential or
//!   randomly permuted build order, read / read-write / cyclic traversals
//! - [`queue`]: lock-free unbounded MPMC sample queue with epoch-based
//!   deferred reclamation (`queue::epoch`)
//! - [`control`]: the periodic scheduler: drift-free absolute wake times,
//!   counter bracketing, per-cycle metric derivation
//! - [`counters`]: the injected counter-reading capability (`rdpmc` + MSR
//!   programming on x86_64, deterministic mock for tests)
//! - [`stats`]: best-effort consumer: batching, aggregation, console or
//!   JSON output
//! - [`affinity`]: core pinning, SCHED_FIFO promotion, cache-line detection
//! - [`cli`]: command-line argument parsing
//! - [`domain`]: core types ([`domain::Sample`], [`domain::CoreId`]) and
//!   structured errors
//!
//! ## Key Concepts
//!
//! - **Pointer chasing**: each load's address depends on the previous
//!   load's result, defeating prefetch and exposing memory latency
//! - **Wakeup jitter**: actual minus intended wake time; intended times are
//!   derived from the previous intended time so the period never drifts
//! - **IPC**: instructions retired per unhalted core cycle across the
//!   workload invocation only

// Expose modules for testing
pub mod affinity;
pub mod cli;
pub mod control;
pub mod counters;
pub mod domain;
pub mod queue;
pub mod stats;
pub mod workload;
