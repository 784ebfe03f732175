//! CLI argument definitions

use clap::Parser;

use crate::control::WorkloadKind;
use crate::stats::OutputMode;

#[derive(Parser)]
#[command(
    name = "rtpulse",
    about = "Measure jitter and cache behavior of a periodic real-time workload",
    after_help = "\
EXAMPLES:
    sudo rtpulse                                 250us cycle, console statistics
    sudo rtpulse -i 500 -s json                  500us cycle, JSON batches on stdout
    sudo rtpulse --workload read-write           mixed read/write cache traffic
    rtpulse --duration 10 --quiet -s json        unprivileged 10s capture"
)]
pub struct Args {
    /// Cycle time of the control thread in microseconds
    #[arg(short = 'i', long, default_value = "250", value_name = "MICROS")]
    pub cycle_time: u64,

    /// Statistics output mode
    #[arg(short = 's', long, value_enum, default_value_t = OutputMode::Console)]
    pub output: OutputMode,

    /// Traversal the control loop runs each cycle
    #[arg(long, value_enum, default_value_t = WorkloadKind::Read)]
    pub workload: WorkloadKind,

    /// Pointer-chase arena size in bytes (pick > L2 to see LLC effects)
    #[arg(long, default_value = "3145728", value_name = "BYTES")]
    pub buffer_size: usize,

    /// Node accesses per cycle (laps per cycle for --workload cyclic)
    #[arg(long, default_value = "5120", value_name = "COUNT")]
    pub node_accesses: usize,

    /// Samples per statistics batch
    #[arg(long, default_value = "1000", value_name = "COUNT")]
    pub batch_size: usize,

    /// Core for the real-time control thread
    #[arg(long, default_value = "3", value_name = "CORE")]
    pub control_core: u32,

    /// Core for the statistics thread
    #[arg(long, default_value = "1", value_name = "CORE")]
    pub stats_core: u32,

    /// Stop after N seconds (0 = run until interrupted)
    #[arg(long, default_value = "0", value_name = "SECS")]
    pub duration: u64,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_configuration() {
        let args = Args::parse_from(["rtpulse"]);
        assert_eq!(args.cycle_time, 250);
        assert_eq!(args.buffer_size, 3 * 1024 * 1024);
        assert_eq!(args.node_accesses, 5 * 1024);
        assert_eq!(args.batch_size, 1000);
        assert_eq!(args.output, OutputMode::Console);
        assert_eq!(args.workload, WorkloadKind::Read);
    }

    #[test]
    fn output_mode_and_workload_parse_from_kebab_case() {
        let args = Args::parse_from(["rtpulse", "-s", "json", "--workload", "read-write"]);
        assert_eq!(args.output, OutputMode::Json);
        assert_eq!(args.workload, WorkloadKind::ReadWrite);
    }
}
