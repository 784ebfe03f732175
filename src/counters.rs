//! Hardware performance counter capability
//!
//! The control loop only needs "read a monotonically increasing counter";
//! everything model-specific lives behind [`CounterSource`], constructed
//! once at startup and passed in by reference. [`RdpmcCounters`] is the
//! Linux x86_64 implementation: it programs the fixed event selectors
//! through `/dev/cpu/<n>/msr`, enables ring-3 `rdpmc`, and reads the PMCs
//! with the `rdpmc` instruction. [`MockCounters`] backs the tests.

use std::sync::atomic::{AtomicU64, Ordering};

use log::info;

use crate::domain::{CoreId, Counter, CounterError};

/// Read-a-counter capability consumed by the control loop.
pub trait CounterSource: Send {
    /// Program and enable the counters on the given core. Fatal at startup
    /// when it fails; never called again mid-loop.
    fn initialize(&mut self, core: CoreId) -> Result<(), CounterError>;

    /// Read a counter. Monotonically non-decreasing within a session.
    fn read(&self, counter: Counter) -> u64;
}

#[cfg(target_arch = "x86_64")]
pub use rdpmc::RdpmcCounters;

#[cfg(target_arch = "x86_64")]
mod rdpmc {
    #![allow(unsafe_code)] // the rdpmc instruction

    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::FileExt;

    use log::info;

    use crate::domain::{CoreId, Counter, CounterError};

    use super::CounterSource;

    const IA32_PERFEVTSEL0: u64 = 0x186;
    const IA32_PERFEVTSEL1: u64 = 0x187;
    const IA32_PERFEVTSEL2: u64 = 0x188;
    const IA32_PERF_GLOBAL_CTRL: u64 = 0x38f;

    /// (event selector MSR, event code, PMC index) per counter.
    /// Codes: LLC misses 0x20d1, instructions retired 0x00c0, unhalted
    /// core cycles 0x003c, each with USR|OS|EN (0x43) in the high byte.
    const PROGRAMMING: [(Counter, u64, u64, u32); 3] = [
        (Counter::LlcMisses, IA32_PERFEVTSEL0, 0x0043_20d1, 0),
        (Counter::InstructionsRetired, IA32_PERFEVTSEL1, 0x0043_00c0, 1),
        (Counter::CoreCycles, IA32_PERFEVTSEL2, 0x0043_003c, 2),
    ];

    enum CoreType {
        Performance,
        Efficiency,
    }

    /// Programmable-counter source reading PMC0..PMC2 via `rdpmc`.
    #[derive(Default)]
    pub struct RdpmcCounters {}

    impl RdpmcCounters {
        #[must_use]
        pub fn new() -> Self {
            RdpmcCounters {}
        }

        fn pmc_index(counter: Counter) -> u32 {
            match counter {
                Counter::LlcMisses => 0,
                Counter::InstructionsRetired => 1,
                Counter::CoreCycles => 2,
            }
        }

        /// Program one event selector and make sure its PMC is enabled in
        /// the global control register.
        fn program_event(
            msr: &std::fs::File,
            core: CoreId,
            evtsel: u64,
            code: u64,
            pmc: u32,
        ) -> Result<(), CounterError> {
            let mut ctrl = [0u8; 8];
            msr.read_exact_at(&mut ctrl, IA32_PERF_GLOBAL_CTRL)
                .map_err(|_| CounterError::MsrRead { msr: IA32_PERF_GLOBAL_CTRL, core })?;
            let mut ctrl = u64::from_le_bytes(ctrl);
            let enable_bit = 1u64 << pmc;
            if ctrl & enable_bit == 0 {
                ctrl |= enable_bit;
                msr.write_all_at(&ctrl.to_le_bytes(), IA32_PERF_GLOBAL_CTRL)
                    .map_err(|_| CounterError::MsrWrite { msr: IA32_PERF_GLOBAL_CTRL, core })?;
            }
            msr.write_all_at(&code.to_le_bytes(), evtsel)
                .map_err(|_| CounterError::MsrWrite { msr: evtsel, core })?;
            Ok(())
        }

        /// CPUID leaf 0x07, EDX bit 15: hybrid platform.
        fn is_hybrid() -> bool {
            let leaf = std::arch::x86_64::__cpuid(0x07);
            leaf.edx & (1 << 15) != 0
        }

        /// CPUID leaf 0x1A native model ID: EAX bit 29 efficiency,
        /// bit 30 performance.
        fn core_type() -> Result<CoreType, CounterError> {
            let leaf = std::arch::x86_64::__cpuid(0x1A);
            if leaf.eax & (1 << 29) != 0 {
                Ok(CoreType::Efficiency)
            } else if leaf.eax & (1 << 30) != 0 {
                Ok(CoreType::Performance)
            } else {
                Err(CounterError::UnknownCoreType)
            }
        }

        /// Allow `rdpmc` from ring 3 for all tasks (echo 2 > .../rdpmc).
        fn enable_ring3_rdpmc() -> Result<(), CounterError> {
            let path = if Self::is_hybrid() {
                match Self::core_type()? {
                    CoreType::Efficiency => "/sys/devices/cpu_atom/rdpmc",
                    CoreType::Performance => "/sys/devices/cpu_core/rdpmc",
                }
            } else {
                "/sys/devices/cpu/rdpmc"
            };
            let mut file = OpenOptions::new().write(true).open(path).map_err(|source| {
                CounterError::RdpmcEnable { path: path.to_string(), source }
            })?;
            file.write_all(b"2").map_err(|source| CounterError::RdpmcEnable {
                path: path.to_string(),
                source,
            })?;
            Ok(())
        }
    }

    impl CounterSource for RdpmcCounters {
        fn initialize(&mut self, core: CoreId) -> Result<(), CounterError> {
            let path = format!("/dev/cpu/{}/msr", core.0);
            let msr = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|source| CounterError::MsrOpen { path: path.clone(), source })?;

            for (counter, evtsel, code, pmc) in PROGRAMMING {
                Self::program_event(&msr, core, evtsel, code, pmc)?;
                info!("programmed {counter} on {core} (PMC{pmc})");
            }
            Self::enable_ring3_rdpmc()?;
            Ok(())
        }

        fn read(&self, counter: Counter) -> u64 {
            let index = Self::pmc_index(counter);
            let lo: u32;
            let hi: u32;
            // SAFETY: rdpmc with a programmed counter index; ring-3 reads
            // were enabled during initialize().
            unsafe {
                std::arch::asm!(
                    "rdpmc",
                    in("ecx") index,
                    out("eax") lo,
                    out("edx") hi,
                    options(nomem, nostack),
                );
            }
            (u64::from(hi) << 32) | u64::from(lo)
        }
    }
}

/// Deterministic counter source for tests: every read advances the counter
/// by a fixed per-counter step.
pub struct MockCounters {
    misses: AtomicU64,
    instructions: AtomicU64,
    cycles: AtomicU64,
    steps: [u64; 3],
}

impl MockCounters {
    /// Steps chosen so a bracketing pair yields misses=3, ipc=2.0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_steps(3, 1_000, 500)
    }

    #[must_use]
    pub fn with_steps(misses: u64, instructions: u64, cycles: u64) -> Self {
        MockCounters {
            misses: AtomicU64::new(0),
            instructions: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            steps: [misses, instructions, cycles],
        }
    }
}

impl Default for MockCounters {
    fn default() -> Self {
        MockCounters::new()
    }
}

impl CounterSource for MockCounters {
    fn initialize(&mut self, core: CoreId) -> Result<(), CounterError> {
        info!("mock counters initialized on {core}");
        Ok(())
    }

    fn read(&self, counter: Counter) -> u64 {
        match counter {
            Counter::LlcMisses => self.misses.fetch_add(self.steps[0], Ordering::Relaxed),
            Counter::InstructionsRetired => {
                self.instructions.fetch_add(self.steps[1], Ordering::Relaxed)
            }
            Counter::CoreCycles => self.cycles.fetch_add(self.steps[2], Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_counters_are_monotonic_with_fixed_deltas() {
        let mock = MockCounters::with_steps(3, 1_000, 500);
        let a = mock.read(Counter::InstructionsRetired);
        let b = mock.read(Counter::InstructionsRetired);
        assert_eq!(b - a, 1_000);

        let before = mock.read(Counter::LlcMisses);
        let after = mock.read(Counter::LlcMisses);
        assert_eq!(after - before, 3);
    }

    #[test]
    fn mock_initialize_always_succeeds() {
        let mut mock = MockCounters::new();
        assert!(mock.initialize(CoreId(0)).is_ok());
    }
}
