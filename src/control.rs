//! Periodic real-time control loop
//!
//! Sleeps to a drift-free absolute deadline, brackets the workload with
//! counter reads, derives per-cycle metrics, and publishes one [`Sample`]
//! per cycle into the shared queue.
//!
//! The next wake time is always computed from the previous *intended* wake
//! time, never from the actual one: anchoring to intent keeps the period
//! exact, while anchoring to reality would accumulate scheduling latency
//! indefinitely.

#![allow(unsafe_code)] // clock_gettime / clock_nanosleep

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ValueEnum;
use log::{info, warn};

use crate::affinity::current_cpu;
use crate::counters::CounterSource;
use crate::domain::{Counter, Sample};
use crate::queue::epoch::LocalEpoch;
use crate::queue::SampleQueue;
use crate::workload::PointerChase;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Which traversal the control loop invokes each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkloadKind {
    /// Dependent-load reads only
    Read,
    /// Reads mixed with position-swap writes
    ReadWrite,
    /// Full laps anchored at the cursor
    Cyclic,
}

/// Configuration and run state for the producer loop.
pub struct ControlLoop {
    cycle_time_ns: i64,
    node_accesses: usize,
    workload: WorkloadKind,
    stop: Arc<AtomicBool>,
}

impl ControlLoop {
    #[must_use]
    pub fn new(
        cycle_time_ns: i64,
        node_accesses: usize,
        workload: WorkloadKind,
        stop: Arc<AtomicBool>,
    ) -> Self {
        ControlLoop { cycle_time_ns, node_accesses, workload, stop }
    }

    /// Run cycles until the stop flag is raised.
    ///
    /// Counter initialization failure is fatal here, before the first
    /// cycle; once the loop is running, a single cycle's counter anomaly
    /// only yields a degenerate sample.
    ///
    /// # Errors
    ///
    /// Returns an error when the current CPU cannot be determined or the
    /// counter source fails to initialize.
    pub fn run(
        &self,
        chase: &mut PointerChase<'_>,
        counters: &mut dyn CounterSource,
        queue: &SampleQueue,
        guard: &LocalEpoch,
    ) -> Result<u64> {
        let core = current_cpu().context("cannot determine current CPU")?;
        info!("control loop running on {core}, cycle time {} ns", self.cycle_time_ns);
        counters
            .initialize(core)
            .with_context(|| format!("failed to initialize counters on {core}"))?;

        let mut cycles: u64 = 0;
        let mut next_wake = monotonic_now();

        while !self.stop.load(Ordering::Relaxed) {
            advance_by_ns(&mut next_wake, self.cycle_time_ns);
            sleep_until(&next_wake);
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            let actual_wake = monotonic_now();

            // Bracketing order mirrors the measurement: misses outermost,
            // wall clock next, instructions/cycles tight around the chase.
            let misses_start = counters.read(Counter::LlcMisses);
            let task_start = monotonic_now();
            let instructions_start = counters.read(Counter::InstructionsRetired);
            let cycles_start = counters.read(Counter::CoreCycles);

            match self.workload {
                WorkloadKind::Read => chase.run_read_workload(self.node_accesses),
                WorkloadKind::ReadWrite => chase.run_read_write_workload(self.node_accesses),
                WorkloadKind::Cyclic => chase.run_workload_read_cyclic(self.node_accesses),
            };

            let instructions_end = counters.read(Counter::InstructionsRetired);
            let cycles_end = counters.read(Counter::CoreCycles);
            let task_end = monotonic_now();
            let misses_end = counters.read(Counter::LlcMisses);

            let sample = Sample {
                exec_time_ns: delta_ns(&task_start, &task_end),
                wakeup_jitter_ns: delta_ns(&next_wake, &actual_wake),
                cache_misses: misses_end.wrapping_sub(misses_start) as i64,
                ipc: ipc(
                    instructions_end.wrapping_sub(instructions_start),
                    cycles_end.wrapping_sub(cycles_start),
                ),
            };
            queue.enqueue(sample, guard);
            cycles += 1;
        }

        info!("control loop stopped after {cycles} cycles");
        Ok(cycles)
    }
}

/// Instructions per cycle; a zero divisor yields the NaN sentinel rather
/// than an error.
#[allow(clippy::cast_precision_loss)]
fn ipc(instructions: u64, cycles: u64) -> f32 {
    if cycles == 0 {
        f32::NAN
    } else {
        instructions as f32 / cycles as f32
    }
}

fn monotonic_now() -> libc::timespec {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts outlives the call; CLOCK_MONOTONIC cannot fail here.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts
}

/// Add `ns` to an absolute timestamp, carrying nanosecond overflow into
/// whole seconds.
fn advance_by_ns(ts: &mut libc::timespec, ns: i64) {
    let mut sec = ts.tv_sec;
    let mut nsec = i64::from(ts.tv_nsec) + ns;
    while nsec >= NANOS_PER_SEC {
        nsec -= NANOS_PER_SEC;
        sec += 1;
    }
    ts.tv_sec = sec;
    ts.tv_nsec = nsec as libc::c_long;
}

/// Signed `end - start` in nanoseconds.
fn delta_ns(start: &libc::timespec, end: &libc::timespec) -> i64 {
    (end.tv_sec - start.tv_sec) * NANOS_PER_SEC + i64::from(end.tv_nsec - start.tv_nsec)
}

/// Suspend until the absolute deadline on the monotonic clock. Interrupted
/// sleeps are resumed; the deadline is absolute, so resuming cannot drift.
fn sleep_until(deadline: &libc::timespec) {
    loop {
        // SAFETY: deadline outlives the call.
        let rc = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                deadline,
                std::ptr::null_mut(),
            )
        };
        if rc == 0 {
            return;
        }
        if rc != libc::EINTR {
            warn!("clock_nanosleep failed: {}", std::io::Error::from_raw_os_error(rc));
            return;
        }
    }
}
