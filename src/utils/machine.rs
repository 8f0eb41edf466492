//! Resource snapshot of the host, reported by agents

use std::fs;

/// Number of logical processors
pub fn processor_count() -> usize {
    num_cpus::get()
}

/// Total memory in MB, 0 when unknown
pub fn total_memory_mb() -> u64 {
    meminfo_field("MemTotal").unwrap_or(0)
}

/// Available memory in MB, 0 when unknown
pub fn available_memory_mb() -> u64 {
    meminfo_field("MemAvailable").unwrap_or(0)
}

/// 1-minute load average as a percentage of all processors
pub fn cpu_load() -> u32 {
    let Ok(loadavg) = fs::read_to_string("/proc/loadavg") else {
        return 0;
    };
    let load: f64 = loadavg
        .split_whitespace()
        .next()
        .and_then(|value| value.parse().ok())
        .unwrap_or(0.0);

    ((load / processor_count().max(1) as f64) * 100.0).round().min(100.0) as u32
}

fn meminfo_field(field: &str) -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo, field)
}

fn parse_meminfo(meminfo: &str, field: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != field {
            return None;
        }
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb / 1024)
    })
}
