// Host capability probe used to size reader windows.
use std::fs;
use std::thread;

use tracing::debug;

/// Headroom kept per thread for everything that is not the mapped window.
pub const CHUNK_RESERVE: usize = 1 << 20;

/// Window size used when memory cannot be determined.
pub const FALLBACK_CHUNK_SIZE: usize = 64 << 20;

pub trait CapabilityProbe {
    fn core_count(&self) -> usize;
    /// Total physical memory in bytes, when known.
    fn total_memory(&self) -> Option<u64>;
}

/// Reads the running host: `available_parallelism` and `/proc/meminfo`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProbe;

impl CapabilityProbe for SystemProbe {
    fn core_count(&self) -> usize {
        thread::available_parallelism().map_or(1, |count| count.get())
    }

    fn total_memory(&self) -> Option<u64> {
        let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
        parse_mem_total(&meminfo)
    }
}

/// Parses the `MemTotal:` line of `/proc/meminfo` into bytes.
pub fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))?;
    let mut fields = line.split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => value.checked_mul(1024),
        Some(_) => None,
    }
}

pub fn max_memory_per_thread(probe: &impl CapabilityProbe) -> Option<u64> {
    let total = probe.total_memory()?;
    let cores = probe.core_count().max(1) as u64;
    Some(total / cores)
}

/// Per-thread memory minus [`CHUNK_RESERVE`], or the whole budget when it is
/// not larger than the reserve.
pub fn default_chunk_size(probe: &impl CapabilityProbe) -> usize {
    let Some(budget) = max_memory_per_thread(probe) else {
        debug!(fallback = FALLBACK_CHUNK_SIZE, "memory size unknown; using fallback chunk size");
        return FALLBACK_CHUNK_SIZE;
    };
    let budget = usize::try_from(budget).unwrap_or(usize::MAX);
    let chunk = if budget > CHUNK_RESERVE {
        budget - CHUNK_RESERVE
    } else {
        budget
    };
    chunk.max(1)
}
