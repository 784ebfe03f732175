//! Thread placement and scheduling-class helpers
//!
//! The producer thread wants a dedicated core and the SCHED_FIFO class; the
//! statistics thread gets a different core at normal priority. Everything
//! here acts on the calling thread.

#![allow(unsafe_code)] // sched_* syscalls take raw cpu_set_t / sched_param

use std::io;

use crate::domain::CoreId;
use crate::workload::CACHE_LINE_SIZE;

/// Pin the calling thread to a single core.
///
/// # Errors
///
/// Returns the OS error when `sched_setaffinity` rejects the core (offline
/// core, restricted cpuset).
pub fn pin_current_thread(core: CoreId) -> io::Result<()> {
    // SAFETY: cpuset is a plain bitmask, zero-initialized then filled by
    // the libc macro equivalents.
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core.0 as usize, &mut cpuset);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Move the calling thread to SCHED_FIFO at the maximum priority.
///
/// # Errors
///
/// Returns the OS error, typically `EPERM` without `CAP_SYS_NICE`.
pub fn set_fifo_priority() -> io::Result<()> {
    // SAFETY: sched_param is a plain struct; 0 targets the calling thread.
    unsafe {
        let param =
            libc::sched_param { sched_priority: libc::sched_get_priority_max(libc::SCHED_FIFO) };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Core the calling thread is currently executing on.
///
/// # Errors
///
/// Returns the OS error when `sched_getcpu` is unavailable.
pub fn current_cpu() -> io::Result<CoreId> {
    // SAFETY: no arguments, returns the current CPU or -1.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(CoreId(cpu as u32))
}

/// Detected data-cache line size, falling back through cache levels and
/// finally to 64 bytes when detection fails.
#[must_use]
pub fn detected_cache_line_size() -> usize {
    cache_size::cache_line_size(1, cache_size::CacheType::Data)
        .or_else(|| cache_size::cache_line_size(1, cache_size::CacheType::Unified))
        .or_else(|| cache_size::cache_line_size(2, cache_size::CacheType::Data))
        .or_else(|| cache_size::cache_line_size(2, cache_size::CacheType::Unified))
        .unwrap_or(CACHE_LINE_SIZE)
}
