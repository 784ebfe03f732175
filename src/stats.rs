//! Best-effort statistics consumer
//!
//! Drains the sample queue on the non-real-time side, accumulates batches
//! of a fixed size, and hands each batch to the selected sink: a running
//! min/max/avg console block, or JSON lines for downstream tooling.
//!
//! The consumer polls; a short sleep between empty polls keeps it off the
//! producer's back, and the shared stop flag makes shutdown cooperative:
//! remaining queued samples are drained and a partial batch is flushed
//! before the thread exits.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::ValueEnum;
use log::debug;

use crate::domain::Sample;
use crate::queue::epoch::LocalEpoch;
use crate::queue::SampleQueue;

/// How batches leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    /// Rewriting min/max/avg block on the console
    Console,
    /// One JSON array per batch on the output stream
    Json,
}

/// Running aggregate over every sample seen so far.
#[derive(Debug)]
pub struct RunningStats {
    pub count: u64,
    pub min_exec_ns: i64,
    pub max_exec_ns: i64,
    sum_exec_ns: i64,
    pub min_jitter_ns: i64,
    pub max_jitter_ns: i64,
    sum_jitter_ns: i64,
    pub min_cache_misses: i64,
    pub max_cache_misses: i64,
    sum_cache_misses: i64,
}

impl Default for RunningStats {
    fn default() -> Self {
        RunningStats::new()
    }
}

impl RunningStats {
    #[must_use]
    pub fn new() -> Self {
        RunningStats {
            count: 0,
            min_exec_ns: i64::MAX,
            max_exec_ns: i64::MIN,
            sum_exec_ns: 0,
            min_jitter_ns: i64::MAX,
            max_jitter_ns: i64::MIN,
            sum_jitter_ns: 0,
            min_cache_misses: i64::MAX,
            max_cache_misses: i64::MIN,
            sum_cache_misses: 0,
        }
    }

    pub fn observe(&mut self, sample: &Sample) {
        self.count += 1;
        self.min_exec_ns = self.min_exec_ns.min(sample.exec_time_ns);
        self.max_exec_ns = self.max_exec_ns.max(sample.exec_time_ns);
        self.sum_exec_ns += sample.exec_time_ns;
        self.min_jitter_ns = self.min_jitter_ns.min(sample.wakeup_jitter_ns);
        self.max_jitter_ns = self.max_jitter_ns.max(sample.wakeup_jitter_ns);
        self.sum_jitter_ns += sample.wakeup_jitter_ns;
        self.min_cache_misses = self.min_cache_misses.min(sample.cache_misses);
        self.max_cache_misses = self.max_cache_misses.max(sample.cache_misses);
        self.sum_cache_misses += sample.cache_misses;
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_exec_ns(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_exec_ns as f64 / self.count as f64
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_jitter_ns(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_jitter_ns as f64 / self.count as f64
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_cache_misses(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_cache_misses as f64 / self.count as f64
        }
    }
}

/// Statistics thread body: batches samples off the queue and emits them.
pub struct StatsConsumer {
    batch_size: usize,
    mode: OutputMode,
    stop: Arc<AtomicBool>,
}

impl StatsConsumer {
    #[must_use]
    pub fn new(batch_size: usize, mode: OutputMode, stop: Arc<AtomicBool>) -> Self {
        StatsConsumer { batch_size: batch_size.max(1), mode, stop }
    }

    /// Poll the queue until the stop flag is raised and the queue is
    /// drained. Returns the number of samples consumed.
    ///
    /// # Errors
    ///
    /// Propagates write errors from the output stream.
    pub fn run(
        &self,
        queue: &SampleQueue,
        guard: &LocalEpoch,
        out: &mut dyn Write,
    ) -> std::io::Result<u64> {
        let mut batch: Vec<Sample> = Vec::with_capacity(self.batch_size);
        let mut running = RunningStats::new();
        let mut consumed: u64 = 0;
        let mut first_block = true;

        loop {
            match queue.dequeue(guard) {
                Some(sample) => {
                    batch.push(sample);
                    consumed += 1;
                    if batch.len() >= self.batch_size {
                        self.emit(&batch, &mut running, &mut first_block, out)?;
                        batch.clear();
                    }
                }
                None => {
                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }

        // Flush whatever a partial final batch holds.
        if !batch.is_empty() {
            self.emit(&batch, &mut running, &mut first_block, out)?;
        }
        debug!("statistics consumer drained {consumed} samples");
        Ok(consumed)
    }

    fn emit(
        &self,
        batch: &[Sample],
        running: &mut RunningStats,
        first_block: &mut bool,
        out: &mut dyn Write,
    ) -> std::io::Result<()> {
        match self.mode {
            OutputMode::Console => {
                for sample in batch {
                    running.observe(sample);
                }
                write_console_block(running, *first_block, out)?;
                *first_block = false;
            }
            OutputMode::Json => {
                serde_json::to_writer(&mut *out, batch)?;
                writeln!(out)?;
                out.flush()?;
            }
        }
        Ok(())
    }
}

#[allow(clippy::cast_precision_loss)]
fn write_console_block(
    stats: &RunningStats,
    first_block: bool,
    out: &mut dyn Write,
) -> std::io::Result<()> {
    if !first_block {
        // Rewrite the previous 4-line block in place.
        write!(out, "\x1b[4A")?;
    }
    writeln!(out, "#### Control Thread Statistics")?;
    writeln!(
        out,
        "Execution Time: Min: {:5}us Max: {:5}us Avg: {:8.2}us",
        stats.min_exec_ns / 1_000,
        stats.max_exec_ns / 1_000,
        stats.avg_exec_ns() / 1_000.0,
    )?;
    writeln!(
        out,
        "Wakeup Jitter:  Min: {:5}us Max: {:5}us Avg: {:8.2}us",
        stats.min_jitter_ns / 1_000,
        stats.max_jitter_ns / 1_000,
        stats.avg_jitter_ns() / 1_000.0,
    )?;
    writeln!(
        out,
        "Cache Misses:   Min: {:5}   Max: {:5}   Avg: {:8.2}",
        stats.min_cache_misses,
        stats.max_cache_misses,
        stats.avg_cache_misses(),
    )?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(exec: i64, jitter: i64, misses: i64) -> Sample {
        Sample { exec_time_ns: exec, wakeup_jitter_ns: jitter, cache_misses: misses, ipc: 1.0 }
    }

    #[test]
    fn running_stats_track_min_max_avg() {
        let mut stats = RunningStats::new();
        stats.observe(&sample(1_000, -50, 3));
        stats.observe(&sample(3_000, 200, 9));
        stats.observe(&sample(2_000, 75, 6));

        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_exec_ns, 1_000);
        assert_eq!(stats.max_exec_ns, 3_000);
        assert!((stats.avg_exec_ns() - 2_000.0).abs() < f64::EPSILON);
        assert_eq!(stats.min_jitter_ns, -50);
        assert_eq!(stats.max_jitter_ns, 200);
        assert_eq!(stats.min_cache_misses, 3);
        assert_eq!(stats.max_cache_misses, 9);
        assert!((stats.avg_cache_misses() - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn json_mode_emits_one_array_per_batch() {
        let queue = SampleQueue::new();
        let guard = queue.register_thread();
        for i in 0..4 {
            queue.enqueue(sample(i, 0, 0), &guard);
        }

        let stop = Arc::new(AtomicBool::new(true)); // stop as soon as drained
        let consumer = StatsConsumer::new(2, OutputMode::Json, stop);
        let mut out = Vec::new();
        let consumed = consumer.run(&queue, &guard, &mut out).unwrap();

        assert_eq!(consumed, 4);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.as_array().unwrap().len(), 2);
        }
    }

    #[test]
    fn partial_final_batch_is_flushed() {
        let queue = SampleQueue::new();
        let guard = queue.register_thread();
        for i in 0..3 {
            queue.enqueue(sample(i, 0, 0), &guard);
        }

        let stop = Arc::new(AtomicBool::new(true));
        let consumer = StatsConsumer::new(10, OutputMode::Json, stop);
        let mut out = Vec::new();
        let consumed = consumer.run(&queue, &guard, &mut out).unwrap();

        assert_eq!(consumed, 3);
        assert_eq!(queue.fill_level(), 0);
        let parsed: serde_json::Value =
            serde_json::from_str(String::from_utf8(out).unwrap().trim()).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 3);
    }

    #[test]
    fn console_block_formats_all_three_rows() {
        let mut stats = RunningStats::new();
        stats.observe(&sample(2_500, -100, 4));
        let mut out = Vec::new();
        write_console_block(&stats, true, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Execution Time"));
        assert!(text.contains("Wakeup Jitter"));
        assert!(text.contains("Cache Misses"));
        assert!(!text.contains("\x1b[4A"), "first block must not move the cursor");

        let mut out2 = Vec::new();
        write_console_block(&stats, false, &mut out2).unwrap();
        assert!(String::from_utf8(out2).unwrap().starts_with("\x1b[4A"));
    }
}
