//! A single supervised OS process: spawn, liveness, graceful stop.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pilot_core::{ChildView, LifecycleState, ProcessSpec, ProcessStats, SupervisionRecord};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of a graceful stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    pub exit_code: Option<i32>,
    /// True when the graceful window elapsed and SIGKILL was needed.
    pub forced: bool,
}

/// Runtime twin of one `ProcessSpec`.
pub struct ChildHandle {
    spec: Arc<ProcessSpec>,
    child: Option<Child>,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    state: LifecycleState,
    exit_code: Option<i32>,
    last_stats: Option<ProcessStats>,
    record: SupervisionRecord,
}

impl ChildHandle {
    pub fn new(spec: Arc<ProcessSpec>) -> Self {
        let record = SupervisionRecord::new(spec.shutdown_strategy);
        Self {
            spec,
            child: None,
            pid: None,
            started_at: None,
            state: LifecycleState::Pending,
            exit_code: None,
            last_stats: None,
            record,
        }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn spec_arc(&self) -> Arc<ProcessSpec> {
        Arc::clone(&self.spec)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn last_stats(&self) -> Option<&ProcessStats> {
        self.last_stats.as_ref()
    }

    pub fn set_stats(&mut self, stats: ProcessStats) {
        self.last_stats = Some(stats);
    }

    pub fn record(&self) -> &SupervisionRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut SupervisionRecord {
        &mut self.record
    }

    /// Snapshot handed to hook and probe callables.
    pub fn view(&self) -> ChildView {
        ChildView {
            name: self.spec.name.clone(),
            pid: self.pid,
            state: self.state,
            restarts: self.record.restarts(),
            ready_params: self.spec.ready_params.clone(),
        }
    }

    /// Fork/exec the spec's command with the merged environment, in
    /// its own process group so a terminal Ctrl-C cannot reach it
    /// directly; the supervisor delivers stop signals itself.
    pub fn spawn(&mut self) -> io::Result<()> {
        let mut command = Command::new(&self.spec.path);
        command
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        self.pid = child.id();
        self.started_at = Some(Utc::now());
        self.exit_code = None;
        self.last_stats = None;
        self.child = Some(child);
        self.state = LifecycleState::Starting;
        debug!(process = self.name(), pid = ?self.pid, "spawned");
        Ok(())
    }

    pub fn mark_ready(&mut self) {
        self.state = LifecycleState::Ready;
    }

    pub fn mark_running(&mut self) {
        self.state = LifecycleState::Running;
    }

    pub fn mark_terminated_by_policy(&mut self) {
        self.state = LifecycleState::TerminatedByPolicy;
    }

    /// Non-blocking liveness check. Records the exit code and moves to
    /// EXITED the first time the process is observed gone.
    pub fn poll_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.finish(exit_code_of(&status));
                false
            }
            Err(err) => {
                warn!(process = self.name(), %err, "liveness poll failed");
                true
            }
        }
    }

    /// Block until the process exits or the deadline passes.
    pub async fn wait(&mut self, deadline: Instant) -> io::Result<Option<i32>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(self.exit_code);
        };
        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => {
                let code = exit_code_of(&status);
                self.finish(code);
                Ok(code)
            }
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Graceful stop: SIGTERM, wait out `graceful_timeout`, then
    /// SIGKILL. A `force` watch flipping to true skips what is left of
    /// the graceful window.
    pub async fn request_stop(
        &mut self,
        graceful_timeout: Duration,
        force: Option<&mut watch::Receiver<bool>>,
    ) -> io::Result<StopOutcome> {
        if self.child.is_none() {
            return Ok(StopOutcome {
                exit_code: self.exit_code,
                forced: false,
            });
        }
        self.state = LifecycleState::Stopping;
        self.signal_term();

        let already_forced = force.as_ref().is_some_and(|f| *f.borrow());
        if !already_forced {
            let deadline = Instant::now() + graceful_timeout;
            let graceful = {
                let Some(child) = self.child.as_mut() else {
                    return Ok(StopOutcome {
                        exit_code: self.exit_code,
                        forced: false,
                    });
                };
                let escalate = async move {
                    match force {
                        Some(rx) => {
                            let _ = rx.changed().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    waited = tokio::time::timeout_at(deadline, child.wait()) => waited.ok(),
                    () = escalate => None,
                }
            };
            match graceful {
                Some(Ok(status)) => {
                    let code = exit_code_of(&status);
                    self.finish(code);
                    return Ok(StopOutcome {
                        exit_code: code,
                        forced: false,
                    });
                }
                Some(Err(err)) => return Err(err),
                None => {}
            }
        }

        // Graceful window exhausted (or skipped): force kill.
        warn!(
            process = self.name(),
            "graceful stop exceeded {:.1}s, sending SIGKILL",
            graceful_timeout.as_secs_f64()
        );
        let status = {
            let Some(child) = self.child.as_mut() else {
                return Ok(StopOutcome {
                    exit_code: self.exit_code,
                    forced: true,
                });
            };
            child.start_kill().ok();
            child.wait().await?
        };
        let code = exit_code_of(&status);
        self.finish(code);
        Ok(StopOutcome {
            exit_code: code,
            forced: true,
        })
    }

    fn finish(&mut self, code: Option<i32>) {
        debug!(process = self.name(), exit_code = ?code, "exited");
        self.exit_code = code;
        self.child = None;
        self.state = LifecycleState::Exited;
    }

    #[cfg(unix)]
    fn signal_term(&self) {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else { return };
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(process = self.name(), %err, "failed to deliver SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    fn signal_term(&self) {
        // No SIGTERM equivalent; request_stop falls through to kill.
    }
}

fn exit_code_of(status: &std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|s| 128 + s))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::ShutdownStrategy;
    use std::collections::BTreeMap;

    fn spec(path: &str, args: &[&str]) -> Arc<ProcessSpec> {
        Arc::new(ProcessSpec {
            name: "test-child".to_string(),
            path: path.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            working_dir: None,
            timeout: 1.0,
            shutdown_strategy: ShutdownStrategy::DoNotRestart,
            ready_strategy: None,
            ready_timeout_sec: None,
            ready_params: BTreeMap::new(),
            dependencies: Vec::new(),
            hooks: Vec::new(),
            stats_handlers: Vec::new(),
        })
    }

    #[tokio::test]
    async fn spawn_records_pid_and_state() {
        let mut child = ChildHandle::new(spec("sleep", &["5"]));
        assert_eq!(child.state(), LifecycleState::Pending);
        child.spawn().expect("spawn sleep");
        assert_eq!(child.state(), LifecycleState::Starting);
        assert!(child.pid().is_some());
        assert!(child.started_at().is_some());
        assert!(child.poll_alive());
        child
            .request_stop(Duration::from_secs(1), None)
            .await
            .expect("stop");
    }

    #[tokio::test]
    async fn natural_exit_is_observed_with_code() {
        let mut child = ChildHandle::new(spec("sh", &["-c", "exit 7"]));
        child.spawn().expect("spawn");
        let code = child
            .wait(Instant::now() + Duration::from_secs(5))
            .await
            .expect("wait");
        assert_eq!(code, Some(7));
        assert_eq!(child.state(), LifecycleState::Exited);
        assert!(!child.poll_alive());
    }

    #[tokio::test]
    async fn graceful_stop_terminates_promptly() {
        let mut child = ChildHandle::new(spec("sleep", &["30"]));
        child.spawn().expect("spawn");
        let outcome = child
            .request_stop(Duration::from_secs(5), None)
            .await
            .expect("stop");
        assert!(!outcome.forced, "sleep dies on SIGTERM");
        assert_eq!(child.state(), LifecycleState::Exited);
    }

    #[tokio::test]
    async fn sigterm_ignorer_is_force_killed() {
        // Trap and ignore TERM, then outlive the graceful window.
        let mut child = ChildHandle::new(spec("sh", &["-c", "trap '' TERM; sleep 30"]));
        child.spawn().expect("spawn");
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = child
            .request_stop(Duration::from_millis(300), None)
            .await
            .expect("stop");
        assert!(outcome.forced, "TERM was trapped, SIGKILL required");
        assert_eq!(child.state(), LifecycleState::Exited);
    }

    #[tokio::test]
    async fn force_watch_skips_the_graceful_window() {
        let mut child = ChildHandle::new(spec("sh", &["-c", "trap '' TERM; sleep 30"]));
        child.spawn().expect("spawn");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (tx, mut rx) = watch::channel(false);
        let killer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(true).ok();
            tx
        });
        let started = Instant::now();
        let outcome = child
            .request_stop(Duration::from_secs(30), Some(&mut rx))
            .await
            .expect("stop");
        assert!(outcome.forced);
        assert!(started.elapsed() < Duration::from_secs(10));
        killer.await.expect("escalation task");
    }

    #[tokio::test]
    async fn env_merges_over_inherited() {
        let mut spec = (*spec("sh", &["-c", "exit ${PILOT_TEST_CODE}"])).clone();
        spec.env
            .insert("PILOT_TEST_CODE".to_string(), "3".to_string());
        let mut child = ChildHandle::new(Arc::new(spec));
        child.spawn().expect("spawn");
        let code = child
            .wait(Instant::now() + Duration::from_secs(5))
            .await
            .expect("wait");
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_io_error() {
        let mut child = ChildHandle::new(spec("/nonexistent/definitely-not-a-binary", &[]));
        assert!(child.spawn().is_err());
        assert_eq!(child.state(), LifecycleState::Pending);
    }

    #[tokio::test]
    async fn restart_changes_pid_and_counts() {
        let mut child = ChildHandle::new(spec("sleep", &["30"]));
        child.spawn().expect("first spawn");
        let first_pid = child.pid();
        child
            .request_stop(Duration::from_secs(1), None)
            .await
            .expect("stop");
        child.record_mut().record_restart();
        child.spawn().expect("second spawn");
        assert_ne!(child.pid(), first_pid);
        assert_eq!(child.record().restarts(), 1);
        child
            .request_stop(Duration::from_secs(1), None)
            .await
            .expect("stop again");
    }
}
