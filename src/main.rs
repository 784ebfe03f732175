//! # rtpulse - Main Entry Point
//!
//! Wires the pieces together: builds the pointer-chase arena, spawns the
//! real-time control thread and the best-effort statistics thread, and
//! supervises both until a signal, the duration limit, or a thread failure
//! ends the run. The two threads share exactly one thing: the lock-free
//! sample queue.

#![allow(unsafe_code)] // signal handler installation
#![allow(clippy::cast_possible_wrap)]

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rtpulse::affinity::{detected_cache_line_size, pin_current_thread, set_fifo_priority};
use rtpulse::cli::Args;
use rtpulse::control::ControlLoop;
use rtpulse::counters::CounterSource;
use rtpulse::domain::CoreId;
use rtpulse::queue::SampleQueue;
use rtpulse::stats::StatsConsumer;
use rtpulse::workload::{ChaseBuffer, PointerChase, CACHE_LINE_SIZE, MIN_NODES};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

static SIGNAL_SEEN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    SIGNAL_SEEN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    // SAFETY: the handler only touches an atomic flag, which is
    // async-signal-safe.
    let handler = on_signal as extern "C" fn(libc::c_int) as usize;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    if args.buffer_size / CACHE_LINE_SIZE < MIN_NODES {
        bail!(
            "--buffer-size {} holds fewer than {MIN_NODES} cache lines ({CACHE_LINE_SIZE} bytes each)",
            args.buffer_size
        );
    }
    if args.control_core == args.stats_core {
        warn!("control and statistics threads share core {}", args.control_core);
    }
    let detected = detected_cache_line_size();
    if detected != CACHE_LINE_SIZE {
        warn!(
            "detected cache line size {detected}, nodes are {CACHE_LINE_SIZE} bytes; \
             per-step traffic will not be one line"
        );
    }

    if !args.quiet {
        println!("rtpulse v{}", env!("CARGO_PKG_VERSION"));
        println!("cycle time: {}us", args.cycle_time);
        println!("workload arena: {} bytes ({} nodes)", args.buffer_size, args.buffer_size / CACHE_LINE_SIZE);
        println!("statistics output: {:?}", args.output);
    }

    install_signal_handlers();

    let stop = Arc::new(AtomicBool::new(false));
    let queue = Arc::new(SampleQueue::new());

    // The counter capability is constructed once, up front, and handed into
    // the control loop by reference.
    let counters: Box<dyn CounterSource> = {
        #[cfg(target_arch = "x86_64")]
        {
            Box::new(rtpulse::counters::RdpmcCounters::new())
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            bail!("hardware counter access requires x86_64 (rdpmc)")
        }
    };

    let cycle_time_ns = (args.cycle_time * 1_000) as i64;
    let control = ControlLoop::new(cycle_time_ns, args.node_accesses, args.workload, Arc::clone(&stop));
    let control_core = CoreId(args.control_core);
    let buffer_size = args.buffer_size;

    let control_handle = {
        let queue = Arc::clone(&queue);
        let guard = queue.register_thread();
        let mut counters = counters;
        thread::Builder::new()
            .name("rtpulse-control".into())
            .spawn(move || -> Result<u64> {
                // SCHED_FIFO needs CAP_SYS_NICE; degrade with a warning so
                // unprivileged runs still demonstrate the pipeline.
                if let Err(e) = set_fifo_priority() {
                    warn!("SCHED_FIFO unavailable ({e}), staying at normal priority");
                }
                pin_current_thread(control_core)
                    .with_context(|| format!("failed to pin control thread to {control_core}"))?;

                let mut buf = ChaseBuffer::with_size_bytes(buffer_size);
                let mut rng = rand_generator();
                let mut chase = PointerChase::random(buf.nodes_mut(), &mut rng)
                    .context("failed to build pointer-chase graph")?;

                control.run(&mut chase, counters.as_mut(), &queue, &guard)
            })
            .context("failed to create control thread")?
    };

    let consumer = StatsConsumer::new(args.batch_size, args.output, Arc::clone(&stop));
    let stats_core = CoreId(args.stats_core);
    let stats_handle = {
        let queue = Arc::clone(&queue);
        let guard = queue.register_thread();
        thread::Builder::new()
            .name("rtpulse-stats".into())
            .spawn(move || -> Result<u64> {
                if let Err(e) = pin_current_thread(stats_core) {
                    warn!("failed to pin statistics thread to {stats_core}: {e}");
                }
                let samples = consumer
                    .run(&queue, &guard, &mut io::stdout())
                    .context("statistics output failed")?;
                Ok(samples)
            })
            .context("failed to create statistics thread")?
    };

    // Supervise: a signal, the duration limit, or a finished control thread
    // ends the run; both threads stop cooperatively via the shared flag.
    let started = Instant::now();
    let duration_limit = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let mut exit_reason = "interrupted";
    loop {
        if SIGNAL_SEEN.load(Ordering::SeqCst) {
            break;
        }
        if let Some(limit) = duration_limit {
            if started.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }
        if control_handle.is_finished() {
            exit_reason = "control thread exited";
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    stop.store(true, Ordering::SeqCst);

    let cycles = control_handle
        .join()
        .map_err(|_| anyhow!("control thread panicked"))?
        .context("control thread failed")?;
    let consumed = stats_handle
        .join()
        .map_err(|_| anyhow!("statistics thread panicked"))?
        .context("statistics thread failed")?;

    info!("final queue fill level: {}", queue.fill_level());
    if !args.quiet {
        eprintln!(
            "\n{}: {:.1}s, {} cycles produced, {} samples consumed",
            exit_reason,
            started.elapsed().as_secs_f64(),
            cycles,
            consumed,
        );
    }

    Ok(())
}

/// Zero-argument generator feeding the randomized build, as the workload
/// expects: it draws from the thread-local RNG.
fn rand_generator() -> impl FnMut() -> u64 {
    use rand::RngCore;
    let mut rng = rand::rng();
    move || rng.next_u64()
}
