//! The monitor loop: one driving tick that polls every child,
//! collects stats, dispatches handlers, applies shutdown policies,
//! and drives restarts until an operator stop or a policy teardown.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use pilot_core::manifest::PARAM_PATH;
use pilot_core::registry::StatsFn;
use pilot_core::{
    BuiltinStrategy, ExitDisposition, HookKind, LifecycleState, PilotError, PluginRegistry,
    ProcessStats,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::child::ChildHandle;
use crate::hooks::HookEngine;
use crate::probe::{self, ProbeVerdict, ReadinessProber};
use crate::stats::{self, StatsSource};

/// Default pause between monitor ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Control commands the façade feeds into the running monitor.
pub enum Command {
    Stop {
        done: oneshot::Sender<()>,
    },
    Restart {
        names: Vec<String>,
        done: oneshot::Sender<Result<(), PilotError>>,
    },
}

/// Why the monitor loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// `stop()` was called (or the façade went away).
    OperatorStop,
    /// A `shutdown_everything` child exited and the fleet was reaped.
    PolicyShutdown { source: String },
    /// The monitor task died unexpectedly; the fleet was killed via
    /// the kill-on-drop safety net.
    InternalError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownKind {
    Operator,
    Policy,
}

/// One resolved stats handler plus the processes subscribed to it.
pub(crate) struct StatsDispatch {
    pub name: String,
    pub handler: StatsFn,
    pub subscribers: HashSet<String>,
}

pub(crate) struct MonitorParams<S> {
    pub children: Vec<ChildHandle>,
    pub stop_order: Vec<String>,
    pub hooks: HookEngine,
    pub prober: ReadinessProber,
    pub stats: S,
    pub dispatches: Vec<StatsDispatch>,
    pub ctrl_rx: mpsc::Receiver<Command>,
    pub force_rx: watch::Receiver<bool>,
    pub tick_interval: Duration,
    pub stop_deadline: Option<Duration>,
}

pub(crate) struct Monitor<S> {
    children: Vec<ChildHandle>,
    stop_order: Vec<String>,
    hooks: HookEngine,
    prober: ReadinessProber,
    stats: S,
    dispatches: Vec<StatsDispatch>,
    ctrl_rx: mpsc::Receiver<Command>,
    force_rx: watch::Receiver<bool>,
    tick_interval: Duration,
    stop_deadline: Option<Duration>,
    probes: JoinSet<(String, ProbeVerdict)>,
}

impl<S: StatsSource> Monitor<S> {
    pub(crate) fn new(params: MonitorParams<S>) -> Self {
        Self {
            children: params.children,
            stop_order: params.stop_order,
            hooks: params.hooks,
            prober: params.prober,
            stats: params.stats,
            dispatches: params.dispatches,
            ctrl_rx: params.ctrl_rx,
            force_rx: params.force_rx,
            tick_interval: params.tick_interval,
            stop_deadline: params.stop_deadline,
            probes: JoinSet::new(),
        }
    }

    pub(crate) async fn run(mut self) -> MonitorExit {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(source) = self.tick_once() {
                        self.teardown(TeardownKind::Policy).await;
                        return MonitorExit::PolicyShutdown { source };
                    }
                }
                cmd = self.ctrl_rx.recv() => match cmd {
                    Some(Command::Stop { done }) => {
                        self.teardown(TeardownKind::Operator).await;
                        let _ = done.send(());
                        return MonitorExit::OperatorStop;
                    }
                    Some(Command::Restart { names, done }) => {
                        let result = self.restart_named(&names).await;
                        let _ = done.send(result);
                    }
                    None => {
                        // Façade dropped without calling stop: reap
                        // the fleet instead of orphaning it.
                        self.teardown(TeardownKind::Operator).await;
                        return MonitorExit::OperatorStop;
                    }
                },
                Some(joined) = self.probes.join_next(), if !self.probes.is_empty() => {
                    self.handle_probe_result(joined).await;
                }
            }
        }
    }

    /// One monitor tick. Returns the name of the child whose policy
    /// demands fleet teardown, if any.
    fn tick_once(&mut self) -> Option<String> {
        self.stats.refresh();
        let hooks = self.hooks.clone();
        let mut batch: Vec<ProcessStats> = Vec::new();
        let mut retired: Vec<String> = Vec::new();
        let mut shutdown_source: Option<String> = None;

        // 1. Poll every child: stats for the living, policy for the dead.
        for i in 0..self.children.len() {
            let child = &mut self.children[i];
            if !matches!(
                child.state(),
                LifecycleState::Ready | LifecycleState::Running
            ) {
                // PENDING children never reach the monitor; STARTING
                // ones are owned by their probe task right now.
                continue;
            }

            if child.poll_alive() {
                child.mark_running();
                if let Some(pid) = child.pid() {
                    if let Some(sample) = self.stats.sample(pid) {
                        let snap = stats::snapshot(child.name(), pid, sample);
                        child.set_stats(snap.clone());
                        batch.push(snap);
                    }
                }
                continue;
            }

            // Newly exited: record, hooks, then the policy machine.
            info!(
                process = child.name(),
                exit_code = ?child.exit_code(),
                "child exited"
            );
            let spec = child.spec_arc();
            hooks.run(&spec, HookKind::OnShutdown, &child.view()).ok();

            match child.record().on_exit() {
                ExitDisposition::Restart => {
                    hooks.run(&spec, HookKind::OnRestart, &child.view()).ok();
                    match child.spawn() {
                        Ok(()) => {
                            let count = child.record_mut().record_restart();
                            info!(process = child.name(), restarts = count, "respawned");
                            if spec.ready_strategy.is_some() {
                                spawn_probe(
                                    &mut self.probes,
                                    &self.prober,
                                    hooks.registry(),
                                    child,
                                );
                            } else {
                                child.mark_ready();
                            }
                        }
                        Err(err) => {
                            warn!(
                                process = child.name(),
                                %err,
                                "respawn failed; giving up on this child"
                            );
                            child.record_mut().demote();
                            retired.push(child.name().to_string());
                        }
                    }
                }
                ExitDisposition::Remove => {
                    debug!(process = child.name(), "removed from the active set");
                    retired.push(child.name().to_string());
                }
                ExitDisposition::ShutdownFleet => {
                    warn!(
                        process = child.name(),
                        "shutdown_everything policy triggered; reaping the fleet"
                    );
                    shutdown_source = Some(child.name().to_string());
                    break;
                }
            }
        }

        if shutdown_source.is_some() {
            return shutdown_source;
        }

        // 2. Every handler sees this tick's batch exactly once.
        self.dispatch_stats(&batch);

        // 3. Retire exited children and their readiness pipes.
        if !retired.is_empty() {
            for child in self
                .children
                .iter()
                .filter(|c| retired.iter().any(|r| r == c.name()))
            {
                remove_pipe_of(child.spec());
            }
            self.children
                .retain(|c| !retired.iter().any(|r| r == c.name()));
        }
        None
    }

    fn dispatch_stats(&self, batch: &[ProcessStats]) {
        debug!(processes = batch.len(), "collected tick stats");
        for dispatch in &self.dispatches {
            let subscribed: Vec<ProcessStats> = batch
                .iter()
                .filter(|s| dispatch.subscribers.contains(&s.name))
                .cloned()
                .collect();
            if let Err(message) = (dispatch.handler)(&subscribed) {
                warn!(
                    handler = %dispatch.name,
                    %message,
                    "stats handler failed; continuing"
                );
            }
        }
    }

    async fn handle_probe_result(&mut self, joined: Result<(String, ProbeVerdict), JoinError>) {
        let (name, verdict) = match joined {
            Ok(pair) => pair,
            Err(err) => {
                if !err.is_cancelled() {
                    warn!(%err, "readiness probe task failed");
                }
                return;
            }
        };
        let Some(idx) = self.children.iter().position(|c| c.name() == name) else {
            return;
        };
        if self.children[idx].state() != LifecycleState::Starting {
            // Stale verdict from before a stop or another restart.
            return;
        }

        match verdict {
            ProbeVerdict::Ready => {
                self.children[idx].mark_ready();
                info!(process = %name, "ready after restart");
            }
            ProbeVerdict::TimedOut => {
                // No retry loop here: one failed readiness after a
                // restart demotes the child to do-not-restart.
                warn!(
                    process = %name,
                    "restart readiness failed; disabling further restarts"
                );
                let hooks = self.hooks.clone();
                let mut force = self.force_rx.clone();
                let child = &mut self.children[idx];
                let spec = child.spec_arc();
                child.record_mut().demote();
                child
                    .request_stop(spec.graceful_timeout(), Some(&mut force))
                    .await
                    .ok();
                hooks.run(&spec, HookKind::OnShutdown, &child.view()).ok();
                remove_pipe_of(&spec);
                self.children.remove(idx);
            }
        }
    }

    /// Operator-requested restart of named, currently-running
    /// children. Validates every name before touching anything.
    async fn restart_named(&mut self, names: &[String]) -> Result<(), PilotError> {
        for name in names {
            let Some(child) = self.children.iter().find(|c| c.name() == name.as_str()) else {
                return Err(PilotError::UnknownProcess(name.clone()));
            };
            if !matches!(
                child.state(),
                LifecycleState::Ready | LifecycleState::Running
            ) {
                return Err(PilotError::NotRunning(name.clone()));
            }
        }

        let hooks = self.hooks.clone();
        for name in names {
            let Some(idx) = self.children.iter().position(|c| c.name() == name.as_str()) else {
                continue;
            };
            let mut failed = false;
            {
                let mut force = self.force_rx.clone();
                let child = &mut self.children[idx];
                let spec = child.spec_arc();
                info!(process = %name, "restarting on request");
                if let Err(err) = child
                    .request_stop(spec.graceful_timeout(), Some(&mut force))
                    .await
                {
                    warn!(process = %name, %err, "stop for restart failed");
                    continue;
                }
                hooks.run(&spec, HookKind::OnShutdown, &child.view()).ok();
                hooks.run(&spec, HookKind::OnRestart, &child.view()).ok();
                match child.spawn() {
                    Ok(()) => {
                        child.record_mut().record_restart();
                        if spec.ready_strategy.is_some() {
                            spawn_probe(&mut self.probes, &self.prober, hooks.registry(), child);
                        } else {
                            child.mark_ready();
                        }
                    }
                    Err(err) => {
                        warn!(process = %name, %err, "respawn failed; dropping child");
                        child.record_mut().demote();
                        failed = true;
                    }
                }
            }
            if failed {
                remove_pipe_of(self.children[idx].spec());
                self.children.remove(idx);
            }
        }
        Ok(())
    }

    /// Reap every still-active child in reverse topological order.
    async fn teardown(&mut self, kind: TeardownKind) {
        info!(reason = ?kind, "fleet teardown");
        self.probes.abort_all();
        let hooks = self.hooks.clone();
        let overall_deadline = self.stop_deadline.map(|d| Instant::now() + d);

        for name in self.stop_order.clone() {
            let Some(idx) = self.children.iter().position(|c| c.name() == name) else {
                continue;
            };
            let spec = self.children[idx].spec_arc();
            if self.children[idx].state().is_active() {
                let mut budget = spec.graceful_timeout();
                if let Some(deadline) = overall_deadline {
                    budget = budget.min(deadline.saturating_duration_since(Instant::now()));
                }
                let mut force = self.force_rx.clone();
                let child = &mut self.children[idx];
                match child.request_stop(budget, Some(&mut force)).await {
                    Ok(outcome) if outcome.forced => {
                        warn!(process = %name, "stop timeout recorded; child was force-killed");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(process = %name, %err, "stop failed"),
                }
                if kind == TeardownKind::Policy {
                    child.mark_terminated_by_policy();
                }
                hooks
                    .run(&spec, HookKind::OnShutdown, &self.children[idx].view())
                    .ok();
            }
            remove_pipe_of(&spec);
        }
        self.children.clear();
        info!("fleet teardown complete");
    }
}

/// Kick off a readiness probe task for a freshly-(re)spawned child.
/// The child stays STARTING until the verdict comes back.
fn spawn_probe(
    probes: &mut JoinSet<(String, ProbeVerdict)>,
    prober: &ReadinessProber,
    registry: &PluginRegistry,
    child: &ChildHandle,
) {
    let Some(strategy_name) = child.spec().ready_strategy.as_deref() else {
        return;
    };
    let Ok(strategy) = registry.resolve_strategy(strategy_name) else {
        return;
    };
    let Some(budget) = child.spec().ready_timeout() else {
        return;
    };
    let deadline = Instant::now() + budget;
    let view = child.view();
    let name = child.name().to_string();
    let prober = prober.clone();
    probes.spawn(async move { (name, prober.probe(&view, &strategy, deadline).await) });
}

fn remove_pipe_of(spec: &pilot_core::ProcessSpec) {
    let is_pipe = spec.ready_strategy.as_deref().and_then(BuiltinStrategy::from_name)
        == Some(BuiltinStrategy::Pipe);
    if is_pipe {
        if let Some(path) = spec.param_str(PARAM_PATH) {
            probe::remove_pipe(Path::new(path));
        }
    }
}
