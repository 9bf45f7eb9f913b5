//! Host-level readings for aggregate system statistics

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;

use crate::engine::EngineError;

/// Kernel clock ticks per second for /proc/stat on every platform we run on.
const USER_HZ: u64 = 100;

static MEMINFO_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(MemTotal|MemAvailable):\s+(\d+)\s*kB").expect("static regex")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub total: u64,
    pub available: u64,
}

#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Cumulative idle time across all cores, in nanoseconds.
    async fn cpu_idle_nanos(&self) -> Result<u64, EngineError>;

    async fn memory(&self) -> Result<MemInfo, EngineError>;

    fn cpu_count(&self) -> usize;
}

/// Reads procfs of the machine the daemon runs on
pub struct ProcHost;

#[async_trait]
impl HostProbe for ProcHost {
    async fn cpu_idle_nanos(&self) -> Result<u64, EngineError> {
        let stat = tokio::fs::read_to_string("/proc/stat").await?;
        parse_cpu_idle(&stat).ok_or_else(|| EngineError::Other("unreadable /proc/stat".to_string()))
    }

    async fn memory(&self) -> Result<MemInfo, EngineError> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await?;
        parse_meminfo(&meminfo).ok_or_else(|| EngineError::Other("unreadable /proc/meminfo".to_string()))
    }

    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Idle field of the aggregate `cpu` line, converted to nanoseconds.
pub fn parse_cpu_idle(stat: &str) -> Option<u64> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let idle: u64 = line.split_whitespace().nth(4)?.parse().ok()?;
    Some(idle * (1_000_000_000 / USER_HZ))
}

pub fn parse_meminfo(meminfo: &str) -> Option<MemInfo> {
    let mut total = None;
    let mut available = None;

    for capture in MEMINFO_LINE.captures_iter(meminfo) {
        let kib: u64 = capture[2].parse().ok()?;
        match &capture[1] {
            "MemTotal" => total = Some(kib * 1024),
            _ => available = Some(kib * 1024),
        }
    }

    Some(MemInfo {
        total: total?,
        available: available?,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemStats {
    pub cpu_engine: f64,
    pub cpu_other: f64,
    pub cpu_total: f64,
    pub mem_engine: u64,
    pub mem_other: u64,
    pub mem_total: u64,
    pub containers_total: usize,
    pub containers_running: usize,
    pub images_total: usize,
    pub images_in_use: usize,
}

impl SystemStats {
    /// `idle_cores` is the average number of idle cores over the interval.
    pub fn compose(cpu_total: f64, cpu_engine: f64, idle_cores: f64, memory: MemInfo, mem_engine: u64) -> Self {
        let used = memory.total.saturating_sub(memory.available);
        Self {
            cpu_engine,
            cpu_other: (cpu_total - idle_cores - cpu_engine).max(0.0),
            cpu_total,
            mem_engine,
            mem_other: used.saturating_sub(mem_engine),
            mem_total: memory.total,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "cpu  4705 356 584 3699176 23060 0 277 0 0 0\n\
                        cpu0 1393 280 290 1852221 6050 0 176 0 0 0\n\
                        intr 1462898\n";

    const MEMINFO: &str = "MemTotal:        8040720 kB\n\
                           MemFree:          370968 kB\n\
                           MemAvailable:    4862788 kB\n\
                           Buffers:          262340 kB\n";

    #[test]
    fn test_parse_cpu_idle() {
        assert_eq!(parse_cpu_idle(STAT), Some(3_699_176 * 10_000_000));
        assert_eq!(parse_cpu_idle("intr 1\n"), None);
    }

    #[test]
    fn test_parse_meminfo() {
        let info = parse_meminfo(MEMINFO).unwrap();
        assert_eq!(info.total, 8_040_720 * 1024);
        assert_eq!(info.available, 4_862_788 * 1024);
        assert_eq!(parse_meminfo("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn test_compose_splits_usage() {
        let memory = MemInfo {
            total: 1000,
            available: 400,
        };
        let stats = SystemStats::compose(4.0, 1.0, 2.5, memory, 200);
        assert_eq!(stats.cpu_other, 0.5);
        assert_eq!(stats.mem_other, 400);
        assert_eq!(stats.mem_total, 1000);

        let idle_host = SystemStats::compose(4.0, 0.0, 4.2, memory, 0);
        assert_eq!(idle_host.cpu_other, 0.0);
    }
}
