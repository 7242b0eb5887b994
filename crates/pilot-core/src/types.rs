//! Core vocabulary shared between the manifest model and the runtime.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Lifecycle ───────────────────────────────────────────────────

/// Lifecycle state of a managed child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Declared in the manifest, not launched yet.
    Pending,
    /// OS process spawned, readiness not yet established.
    Starting,
    /// Readiness probe succeeded (or no probe declared).
    Ready,
    /// Confirmed alive by the monitor after readiness.
    Running,
    /// A stop or restart has been requested.
    Stopping,
    /// The OS process has terminated.
    Exited,
    /// Reaped because a peer's shutdown policy tore the fleet down.
    TerminatedByPolicy,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Exited => "exited",
            Self::TerminatedByPolicy => "terminated_by_policy",
        }
    }

    /// True while the child still has (or is about to have) a live OS process.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Exited | Self::TerminatedByPolicy)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Shutdown strategy ───────────────────────────────────────────

/// What the monitor does when this child exits on its own.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownStrategy {
    /// Respawn immediately and re-run readiness.
    #[default]
    Restart,
    /// Drop from the active set; dependents keep running.
    DoNotRestart,
    /// Tear the whole fleet down.
    ShutdownEverything,
}

impl ShutdownStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::DoNotRestart => "do_not_restart",
            Self::ShutdownEverything => "shutdown_everything",
        }
    }
}

impl fmt::Display for ShutdownStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Hooks ───────────────────────────────────────────────────────

/// Lifecycle transition a hook callable attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    PreStart,
    PostStart,
    OnShutdown,
    OnRestart,
}

impl HookKind {
    pub const ALL: [Self; 4] = [
        Self::PreStart,
        Self::PostStart,
        Self::OnShutdown,
        Self::OnRestart,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreStart => "pre_start",
            Self::PostStart => "post_start",
            Self::OnShutdown => "on_shutdown",
            Self::OnRestart => "on_restart",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Readiness strategies ────────────────────────────────────────

/// The three readiness strategies shipped with the supervisor.
///
/// Anything else named in a manifest resolves through the plugin
/// registry instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinStrategy {
    Tcp,
    File,
    Pipe,
}

impl BuiltinStrategy {
    pub const ALL: [Self; 3] = [Self::Tcp, Self::File, Self::Pipe];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::File => "file",
            Self::Pipe => "pipe",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(Self::Tcp),
            "file" => Some(Self::File),
            "pipe" => Some(Self::Pipe),
            _ => None,
        }
    }
}

impl fmt::Display for BuiltinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Stats ───────────────────────────────────────────────────────

/// Point-in-time resource snapshot for one running child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub name: String,
    pub pid: u32,
    /// Resident memory in megabytes.
    pub memory_mb: f64,
    /// CPU usage over the interval since the previous collection.
    /// The first sample for a process is always 0.0.
    pub cpu_percent: f32,
    pub num_threads: u32,
    pub num_children: u32,
    pub collected_at: DateTime<Utc>,
}

// ─── Child view ──────────────────────────────────────────────────

/// Read-only view of a child handed to hook and probe callables.
///
/// Callables must not retain this past the invocation; it is a
/// snapshot, not a live handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildView {
    pub name: String,
    pub pid: Option<u32>,
    pub state: LifecycleState,
    pub restarts: u32,
    pub ready_params: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_round_trips_through_serde() {
        let json = serde_json::to_string(&LifecycleState::TerminatedByPolicy).expect("serialize");
        assert_eq!(json, "\"terminated_by_policy\"");
        let back: LifecycleState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, LifecycleState::TerminatedByPolicy);
    }

    #[test]
    fn lifecycle_activity() {
        assert!(LifecycleState::Pending.is_active());
        assert!(LifecycleState::Running.is_active());
        assert!(LifecycleState::Stopping.is_active());
        assert!(!LifecycleState::Exited.is_active());
        assert!(!LifecycleState::TerminatedByPolicy.is_active());
    }

    #[test]
    fn shutdown_strategy_defaults_to_restart() {
        assert_eq!(ShutdownStrategy::default(), ShutdownStrategy::Restart);
    }

    #[test]
    fn shutdown_strategy_snake_case_names() {
        let s: ShutdownStrategy = serde_json::from_str("\"do_not_restart\"").expect("deserialize");
        assert_eq!(s, ShutdownStrategy::DoNotRestart);
        assert_eq!(s.to_string(), "do_not_restart");
    }

    #[test]
    fn builtin_strategy_from_name() {
        assert_eq!(BuiltinStrategy::from_name("tcp"), Some(BuiltinStrategy::Tcp));
        assert_eq!(BuiltinStrategy::from_name("file"), Some(BuiltinStrategy::File));
        assert_eq!(BuiltinStrategy::from_name("pipe"), Some(BuiltinStrategy::Pipe));
        assert_eq!(BuiltinStrategy::from_name("http"), None);
    }

    #[test]
    fn hook_kind_covers_all_transitions() {
        let names: Vec<&str> = HookKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            names,
            vec!["pre_start", "post_start", "on_shutdown", "on_restart"]
        );
    }
}
