//! End-to-end pipeline tests: workload graph, control loop, lock-free queue
//! and statistics consumer wired together, with mock counters standing in
//! for the PMU so the tests run unprivileged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rtpulse::control::{ControlLoop, WorkloadKind};
use rtpulse::counters::MockCounters;
use rtpulse::queue::SampleQueue;
use rtpulse::stats::{OutputMode, StatsConsumer};
use rtpulse::workload::{ChaseBuffer, PointerChase, CACHE_LINE_SIZE};

/// Deterministic 64-bit generator (LCG) so graph-shape tests are repeatable.
fn seeded_generator(mut state: u64) -> impl FnMut() -> u64 {
    move || {
        state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        state
    }
}

#[test]
fn randomized_graph_is_a_single_cycle_over_the_whole_arena() {
    let n = 64;
    let mut buf = ChaseBuffer::with_size_bytes(n * CACHE_LINE_SIZE);
    let mut chase = PointerChase::random(buf.nodes_mut(), seeded_generator(0x2545_f491)).unwrap();

    let start = chase.cursor();
    let mut seen = std::collections::HashSet::new();
    let mut cur = start;
    for _ in 0..n {
        cur = chase.run_read_workload(1);
        seen.insert(cur);
    }
    assert_eq!(cur, start, "a full lap must return to the starting node");
    assert_eq!(seen.len(), n, "a full lap must visit every node exactly once");
}

#[test]
fn read_write_traffic_keeps_the_cycle_intact() {
    let n = 6;
    let mut buf = ChaseBuffer::with_size_bytes(n * CACHE_LINE_SIZE);
    let mut chase = PointerChase::linear(buf.nodes_mut()).unwrap();

    chase.run_read_write_workload(100);

    let start = chase.cursor();
    let mut seen = std::collections::HashSet::new();
    let mut cur = start;
    for _ in 0..n {
        cur = chase.run_read_workload(1);
        seen.insert(cur);
    }
    assert_eq!(cur, start);
    assert_eq!(seen.len(), n);
}

#[test]
fn undersized_arena_is_rejected() {
    let mut buf = ChaseBuffer::with_size_bytes(5 * CACHE_LINE_SIZE);
    assert!(PointerChase::linear(buf.nodes_mut()).is_err());
}

#[test]
fn samples_flow_from_control_loop_to_json_output() {
    let stop = Arc::new(AtomicBool::new(false));
    let queue = Arc::new(SampleQueue::new());

    let control = ControlLoop::new(1_000_000, 64, WorkloadKind::Read, Arc::clone(&stop));
    let control_handle = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let guard = queue.register_thread();
            let mut buf = ChaseBuffer::with_size_bytes(64 * CACHE_LINE_SIZE);
            let mut chase =
                PointerChase::random(buf.nodes_mut(), seeded_generator(0x9e37)).unwrap();
            let mut counters = MockCounters::new();
            control.run(&mut chase, &mut counters, &queue, &guard)
        })
    };

    thread::sleep(Duration::from_millis(50));
    stop.store(true, Ordering::SeqCst);
    let cycles = control_handle.join().unwrap().unwrap();
    assert!(cycles >= 1, "the 1ms loop must complete at least one cycle in 50ms");

    // All producer cycles are enqueued by now; the consumer drains them.
    let consumer = StatsConsumer::new(8, OutputMode::Json, Arc::clone(&stop));
    let guard = queue.register_thread();
    let mut out = Vec::new();
    let consumed = consumer.run(&queue, &guard, &mut out).unwrap();

    assert_eq!(consumed, cycles);
    assert_eq!(queue.fill_level(), 0);

    // Each output line is a JSON array of samples.
    let text = String::from_utf8(out).unwrap();
    let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    let batch = first.as_array().unwrap();
    assert!(!batch.is_empty());
    let sample = &batch[0];
    assert_eq!(sample["cache_misses"], 3);
    assert!(sample["exec_time_ns"].as_i64().unwrap() >= 0);
    assert!((sample["ipc"].as_f64().unwrap() - 2.0).abs() < f64::EPSILON);
}
