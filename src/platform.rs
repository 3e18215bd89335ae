//! Platform bootstrap: processor topology, memory size, and the epoch clock.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::Error;

/// Assumed when the platform refuses to report its memory size.
const DEFAULT_TOTAL_MEMORY: i64 = 4 * 1024 * 1024 * 1024;

static INIT_COUNT: AtomicU32 = AtomicU32::new(0);
static TOTAL_MEMORY: AtomicI64 = AtomicI64::new(0);
#[cfg(any(test, feature = "internal-testing"))]
static TOTAL_MEMORY_OVERRIDE: AtomicI64 = AtomicI64::new(0);

/// Brings up process-wide platform state. Balanced by [`uninit`]; nested
/// initializations are counted so independent library instances compose.
pub(crate) fn init() -> Result<(), Error> {
    if INIT_COUNT.fetch_add(1, Ordering::AcqRel) == 0 {
        debug!("platform initialized, {} processor(s)", processor_count());
    }
    Ok(())
}

pub(crate) fn uninit() {
    let previous = INIT_COUNT.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(previous > 0);
    if previous == 1 {
        debug!("platform uninitialized");
    }
}

/// Number of processors available to this process, at least 1.
pub(crate) fn processor_count() -> u16 {
    std::thread::available_parallelism()
        .map(|n| n.get().min(u16::MAX as usize) as u16)
        .unwrap_or(1)
}

/// Granularity of the platform's timers, in milliseconds, rounded up.
pub(crate) fn timer_resolution_ms() -> u8 {
    1
}

/// Physical memory size in bytes, used to scale the handshake-memory limit.
pub(crate) fn total_memory() -> i64 {
    #[cfg(any(test, feature = "internal-testing"))]
    {
        let forced = TOTAL_MEMORY_OVERRIDE.load(Ordering::Acquire);
        if forced != 0 {
            return forced;
        }
    }
    let cached = TOTAL_MEMORY.load(Ordering::Acquire);
    if cached != 0 {
        return cached;
    }
    let queried = query_total_memory();
    TOTAL_MEMORY.store(queried, Ordering::Release);
    queried
}

/// Forces [`total_memory`] to report a fixed size. `None` restores the
/// platform-reported value.
#[cfg(any(test, feature = "internal-testing"))]
pub fn set_total_memory(bytes: Option<i64>) {
    TOTAL_MEMORY_OVERRIDE.store(bytes.unwrap_or(0), Ordering::Release);
}

fn query_total_memory() -> i64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            for line in meminfo.lines() {
                if let Some(rest) = line.strip_prefix("MemTotal:") {
                    if let Some(kb) = rest
                        .split_whitespace()
                        .next()
                        .and_then(|v| v.parse::<i64>().ok())
                    {
                        return kb * 1024;
                    }
                }
            }
        }
    }
    DEFAULT_TOTAL_MEMORY
}

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processor_count_is_positive() {
        assert!(processor_count() >= 1);
    }

    #[test]
    fn total_memory_is_plausible() {
        let memory = total_memory();
        assert!(memory >= 64 * 1024 * 1024, "reported {} bytes", memory);
    }

    #[test]
    fn epoch_clock_advances() {
        let a = epoch_millis();
        let b = epoch_millis();
        assert!(b >= a);
        assert!(a > 1_500_000_000_000, "clock reads before 2017: {}", a);
    }
}
