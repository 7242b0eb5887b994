//! Resource sampling for supervised children.
//!
//! Sits behind a trait so monitor tests can stub the OS out.

use chrono::Utc;
use pilot_core::ProcessStats;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// One raw sample read from the OS process table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSample {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
    pub num_threads: u32,
    pub num_children: u32,
}

pub trait StatsSource: Send + 'static {
    /// Refresh the process table. Called once per monitor tick,
    /// before any `sample` calls.
    fn refresh(&mut self);

    /// Sample one process; `None` when the PID is gone.
    fn sample(&mut self, pid: u32) -> Option<StatsSample>;
}

/// sysinfo-backed collector. CPU usage is computed by sysinfo against
/// the previous refresh, so the first sample for a process is 0.0.
pub struct SysinfoStats {
    system: System,
}

impl SysinfoStats {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSource for SysinfoStats {
    fn refresh(&mut self) {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
    }

    fn sample(&mut self, pid: u32) -> Option<StatsSample> {
        let target = Pid::from_u32(pid);
        let process = self.system.process(target)?;

        let num_children = self
            .system
            .processes()
            .values()
            .filter(|p| p.parent() == Some(target))
            .count() as u32;

        #[cfg(target_os = "linux")]
        let num_threads = process.tasks().map_or(1, |tasks| tasks.len() as u32);
        #[cfg(not(target_os = "linux"))]
        let num_threads = 0;

        Some(StatsSample {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
            num_threads,
            num_children,
        })
    }
}

/// Stamp a raw sample into the snapshot handed to stats handlers.
pub fn snapshot(name: &str, pid: u32, sample: StatsSample) -> ProcessStats {
    ProcessStats {
        name: name.to_string(),
        pid,
        memory_mb: sample.memory_bytes as f64 / (1024.0 * 1024.0),
        cpu_percent: sample.cpu_percent,
        num_threads: sample.num_threads,
        num_children: sample.num_children,
        collected_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_own_process() {
        let mut source = SysinfoStats::new();
        source.refresh();
        let sample = source
            .sample(std::process::id())
            .expect("own process should be visible");
        assert!(sample.memory_bytes > 0);
        // First collection has no previous refresh to diff against.
        assert_eq!(sample.cpu_percent, 0.0);
    }

    #[test]
    fn unknown_pid_yields_none() {
        let mut source = SysinfoStats::new();
        source.refresh();
        // A PID far past the default pid_max space.
        assert!(source.sample(u32::MAX - 1).is_none());
    }

    #[test]
    fn snapshot_converts_memory_to_megabytes() {
        let stats = snapshot(
            "web",
            42,
            StatsSample {
                memory_bytes: 8 * 1024 * 1024,
                cpu_percent: 1.5,
                num_threads: 4,
                num_children: 2,
            },
        );
        assert_eq!(stats.name, "web");
        assert_eq!(stats.pid, 42);
        assert!((stats.memory_mb - 8.0).abs() < f64::EPSILON);
        assert_eq!(stats.num_threads, 4);
        assert_eq!(stats.num_children, 2);
    }
}
