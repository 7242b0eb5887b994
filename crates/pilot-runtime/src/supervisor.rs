//! Supervisor façade: validates, launches the fleet batch by batch
//! with readiness gating, then hands the children to the monitor loop
//! and owns the control channel and signal handling.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pilot_core::manifest::PARAM_PATH;
use pilot_core::{
    BuiltinStrategy, HookKind, PilotError, PilotPlugin, PluginRegistry, ProcessManifest,
    ProcessSpec,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::child::ChildHandle;
use crate::hooks::HookEngine;
use crate::monitor::{
    Command, DEFAULT_TICK_INTERVAL, Monitor, MonitorExit, MonitorParams, StatsDispatch,
};
use crate::probe::{self, DEFAULT_POLL_INTERVAL, ProbeVerdict, ReadinessProber};
use crate::stats::SysinfoStats;

/// Tunables for the supervision engine.
#[derive(Debug, Clone)]
pub struct PilotOptions {
    /// Pause between monitor ticks.
    pub tick_interval: Duration,
    /// Pause between readiness polls.
    pub probe_interval: Duration,
    /// Optional cap on a whole fleet teardown; children past it are
    /// force-killed.
    pub stop_deadline: Option<Duration>,
}

impl Default for PilotOptions {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            probe_interval: DEFAULT_POLL_INTERVAL,
            stop_deadline: None,
        }
    }
}

enum Phase {
    Idle {
        registry: PluginRegistry,
    },
    Running {
        ctrl_tx: mpsc::Sender<Command>,
        force_tx: watch::Sender<bool>,
        monitor: tokio::task::JoinHandle<MonitorExit>,
    },
    Stopped,
}

/// The public face of the supervisor. Owns the child set for the
/// lifetime of a start/stop pair; everything else reaches the fleet
/// through its command channel.
pub struct ProcessPilot {
    manifest: Arc<ProcessManifest>,
    options: PilotOptions,
    phase: Phase,
}

impl ProcessPilot {
    /// The manifest is already structurally validated by
    /// `ProcessManifest::new`; capability references are checked at
    /// `start`, once all plugins are registered.
    pub fn new(manifest: ProcessManifest, options: PilotOptions) -> Self {
        Self {
            manifest: Arc::new(manifest),
            options,
            phase: Phase::Idle {
                registry: PluginRegistry::new(),
            },
        }
    }

    pub fn manifest(&self) -> &ProcessManifest {
        &self.manifest
    }

    /// Register plugins. Legal only before `start`.
    pub fn register_plugins(
        &mut self,
        plugins: impl IntoIterator<Item = Arc<dyn PilotPlugin>>,
    ) -> Result<(), PilotError> {
        let Phase::Idle { registry } = &mut self.phase else {
            return Err(PilotError::AlreadyStarted);
        };
        for plugin in plugins {
            registry.register(plugin)?;
        }
        Ok(())
    }

    /// Launch the fleet: batches in topological order, readiness-gated.
    /// Blocks until every child is READY, or until the partial fleet
    /// has been torn down again after a startup failure.
    pub async fn start(&mut self) -> Result<(), PilotError> {
        let Phase::Idle { registry } = &mut self.phase else {
            return Err(PilotError::AlreadyStarted);
        };
        registry.validate_manifest(&self.manifest)?;
        let registry = Arc::new(std::mem::take(registry));

        // Readiness pipes must exist before any pre-start hook runs.
        let mut pipes: Vec<PathBuf> = Vec::new();
        for spec in self.manifest.specs() {
            if !is_pipe_strategy(spec) {
                continue;
            }
            let Some(path) = spec.param_str(PARAM_PATH) else {
                continue;
            };
            let path = PathBuf::from(path);
            if let Err(err) = probe::create_pipe(&path) {
                for created in &pipes {
                    probe::remove_pipe(created);
                }
                self.phase = Phase::Stopped;
                return Err(PilotError::StartupFailure {
                    process: spec.name.clone(),
                    reason: format!("cannot create readiness pipe: {err}"),
                });
            }
            pipes.push(path);
        }

        let hooks = HookEngine::new(Arc::clone(&registry));
        let prober = ReadinessProber::new(self.options.probe_interval);

        let mut started: Vec<ChildHandle> = Vec::new();
        let mut failure: Option<(String, String)> = None;

        for batch in self.manifest.plan().batches() {
            debug!(?batch, "starting batch");
            let mut join: JoinSet<Result<ChildHandle, (String, String)>> = JoinSet::new();
            for name in batch {
                let Some(spec) = self.manifest.get(name) else {
                    continue;
                };
                join.spawn(launch_one(
                    Arc::new(spec.clone()),
                    hooks.clone(),
                    prober.clone(),
                ));
            }

            let mut ready: Vec<ChildHandle> = Vec::new();
            while let Some(joined) = join.join_next().await {
                match joined {
                    Ok(Ok(child)) => ready.push(child),
                    Ok(Err((name, reason))) => {
                        if failure.is_none() {
                            failure = Some((name, reason));
                        }
                    }
                    Err(err) => {
                        if failure.is_none() {
                            failure = Some(("<startup>".to_string(), err.to_string()));
                        }
                    }
                }
            }
            // Declaration order within the batch, for deterministic
            // teardown and logs.
            ready.sort_by_key(|c| batch.iter().position(|n| n.as_str() == c.name()));
            started.extend(ready);
            if failure.is_some() {
                break;
            }
        }

        if let Some((process, reason)) = failure {
            warn!(%process, %reason, "startup failed; tearing down partial fleet");
            for child in started.iter_mut().rev() {
                if !child.state().is_active() {
                    continue;
                }
                let spec = child.spec_arc();
                child
                    .request_stop(spec.graceful_timeout(), None)
                    .await
                    .ok();
                hooks.run(&spec, HookKind::OnShutdown, &child.view()).ok();
            }
            for path in &pipes {
                probe::remove_pipe(path);
            }
            self.phase = Phase::Stopped;
            return Err(PilotError::StartupFailure { process, reason });
        }

        let dispatches = build_dispatches(&self.manifest, &registry);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(16);
        let (force_tx, force_rx) = watch::channel(false);
        let monitor = Monitor::new(MonitorParams {
            children: started,
            stop_order: self.manifest.plan().stop_order().to_vec(),
            hooks,
            prober,
            stats: SysinfoStats::new(),
            dispatches,
            ctrl_rx,
            force_rx,
            tick_interval: self.options.tick_interval,
            stop_deadline: self.options.stop_deadline,
        });
        let monitor = tokio::spawn(monitor.run());
        self.phase = Phase::Running {
            ctrl_tx,
            force_tx,
            monitor,
        };
        info!(processes = self.manifest.len(), "fleet is ready");
        Ok(())
    }

    /// Tear the fleet down and wait for the monitor to finish.
    /// Idempotent: a second call returns immediately.
    pub async fn stop(&mut self) -> Result<(), PilotError> {
        match std::mem::replace(&mut self.phase, Phase::Stopped) {
            Phase::Idle { registry } => {
                self.phase = Phase::Idle { registry };
                Err(PilotError::NotStarted)
            }
            Phase::Stopped => Ok(()),
            Phase::Running {
                ctrl_tx, monitor, ..
            } => {
                let (done_tx, done_rx) = oneshot::channel();
                if ctrl_tx
                    .send(Command::Stop { done: done_tx })
                    .await
                    .is_ok()
                {
                    let _ = done_rx.await;
                }
                match monitor.await {
                    Ok(exit) => {
                        debug!(?exit, "monitor finished");
                        Ok(())
                    }
                    Err(err) => Err(PilotError::Internal(format!("monitor task failed: {err}"))),
                }
            }
        }
    }

    /// Restart named children. Every name must be known and currently
    /// running; validation happens before any child is touched.
    pub async fn restart_processes(&mut self, names: &[String]) -> Result<(), PilotError> {
        for name in names {
            if !self.manifest.contains(name) {
                return Err(PilotError::UnknownProcess(name.clone()));
            }
        }
        let Phase::Running { ctrl_tx, .. } = &self.phase else {
            return Err(PilotError::NotStarted);
        };
        let (done_tx, done_rx) = oneshot::channel();
        ctrl_tx
            .send(Command::Restart {
                names: names.to_vec(),
                done: done_tx,
            })
            .await
            .map_err(|_| PilotError::Internal("monitor is gone".to_string()))?;
        done_rx
            .await
            .map_err(|_| PilotError::Internal("restart request dropped".to_string()))?
    }

    /// Wait for the monitor to end on its own (policy shutdown or an
    /// internal failure).
    pub async fn wait(&mut self) -> Result<MonitorExit, PilotError> {
        let Phase::Running { monitor, .. } = &mut self.phase else {
            return Err(PilotError::NotStarted);
        };
        let result = monitor.await;
        self.phase = Phase::Stopped;
        match result {
            Ok(exit) => Ok(exit),
            // A panicked monitor still kills the fleet through the
            // kill-on-drop child handles.
            Err(err) => Ok(MonitorExit::InternalError(err.to_string())),
        }
    }

    /// Start, then supervise until the fleet ends on its own or a stop
    /// signal arrives. A second SIGINT during teardown force-kills the
    /// stragglers.
    pub async fn run(mut self) -> Result<MonitorExit, PilotError> {
        self.start().await?;
        let Phase::Running { force_tx, .. } = &self.phase else {
            return Err(PilotError::Internal("not running after start".to_string()));
        };
        let force_tx = force_tx.clone();

        tokio::select! {
            exit = self.wait() => exit,
            _ = shutdown_signal() => {
                info!("stop signal received; shutting down");
                tokio::spawn(async move {
                    shutdown_signal().await;
                    warn!("second stop signal; force-killing remaining children");
                    let _ = force_tx.send(true);
                });
                self.stop().await?;
                Ok(MonitorExit::OperatorStop)
            }
        }
    }
}

/// Pre-start hooks, spawn, post-start hooks, readiness probe. The
/// readiness budget runs from just before the spawn, and a child that
/// fails is stopped again before the error is reported.
async fn launch_one(
    spec: Arc<ProcessSpec>,
    hooks: HookEngine,
    prober: ReadinessProber,
) -> Result<ChildHandle, (String, String)> {
    let mut child = ChildHandle::new(Arc::clone(&spec));

    if let Err(err) = hooks.run(&spec, HookKind::PreStart, &child.view()) {
        return Err((spec.name.clone(), err.to_string()));
    }
    let ready_clock_start = Instant::now();

    if let Err(err) = child.spawn() {
        return Err((spec.name.clone(), format!("spawn failed: {err}")));
    }
    hooks.run(&spec, HookKind::PostStart, &child.view()).ok();

    let Some(strategy_name) = spec.ready_strategy.as_deref() else {
        child.mark_ready();
        return Ok(child);
    };
    let strategy = match hooks.registry().resolve_strategy(strategy_name) {
        Ok(strategy) => strategy,
        Err(err) => {
            child
                .request_stop(spec.graceful_timeout(), None)
                .await
                .ok();
            return Err((spec.name.clone(), err.to_string()));
        }
    };
    let budget = spec.ready_timeout().unwrap_or_default();
    match prober
        .probe(&child.view(), &strategy, ready_clock_start + budget)
        .await
    {
        ProbeVerdict::Ready => {
            child.mark_ready();
            info!(process = %spec.name, "ready");
            Ok(child)
        }
        ProbeVerdict::TimedOut => {
            warn!(
                process = %spec.name,
                "not ready within {:.1}s; stopping it",
                budget.as_secs_f64()
            );
            child
                .request_stop(spec.graceful_timeout(), None)
                .await
                .ok();
            hooks.run(&spec, HookKind::OnShutdown, &child.view()).ok();
            Err((
                spec.name.clone(),
                format!("not ready within {:.1}s", budget.as_secs_f64()),
            ))
        }
    }
}

fn is_pipe_strategy(spec: &ProcessSpec) -> bool {
    spec.ready_strategy
        .as_deref()
        .and_then(BuiltinStrategy::from_name)
        == Some(BuiltinStrategy::Pipe)
}

/// Resolve each stats handler named anywhere in the manifest, paired
/// with the set of processes subscribed to it.
fn build_dispatches(manifest: &ProcessManifest, registry: &PluginRegistry) -> Vec<StatsDispatch> {
    let mut order: Vec<String> = Vec::new();
    let mut subscribers: HashMap<String, HashSet<String>> = HashMap::new();
    for spec in manifest.specs() {
        for handler in &spec.stats_handlers {
            if !subscribers.contains_key(handler) {
                order.push(handler.clone());
            }
            subscribers
                .entry(handler.clone())
                .or_default()
                .insert(spec.name.clone());
        }
    }
    order
        .into_iter()
        .filter_map(|name| {
            registry.resolve_stats(&name).ok().map(|handler| StatsDispatch {
                subscribers: subscribers.remove(&name).unwrap_or_default(),
                name,
                handler,
            })
        })
        .collect()
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "cannot listen for SIGTERM");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_core::ShutdownStrategy;
    use std::collections::BTreeMap;

    fn sleeper(name: &str) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            path: "sleep".to_string(),
            args: vec!["30".to_string()],
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
        }
    }

    fn pilot_of(specs: Vec<ProcessSpec>) -> ProcessPilot {
        let manifest = ProcessManifest::new(specs).expect("manifest");
        ProcessPilot::new(manifest, PilotOptions::default())
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let mut pilot = pilot_of(vec![sleeper("a")]);
        pilot.start().await.expect("first start");
        let err = pilot.start().await.expect_err("second start");
        assert!(matches!(err, PilotError::AlreadyStarted));
        pilot.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn stop_before_start_is_rejected() {
        let mut pilot = pilot_of(vec![sleeper("a")]);
        let err = pilot.stop().await.expect_err("not started");
        assert!(matches!(err, PilotError::NotStarted));
    }

    #[tokio::test]
    async fn stop_twice_is_idempotent() {
        let mut pilot = pilot_of(vec![sleeper("a")]);
        pilot.start().await.expect("start");
        pilot.stop().await.expect("first stop");
        let started = Instant::now();
        pilot.stop().await.expect("second stop is a no-op");
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn register_plugins_after_start_is_rejected() {
        struct NoopPlugin;
        impl PilotPlugin for NoopPlugin {
            fn name(&self) -> &str {
                "noop"
            }
        }
        let mut pilot = pilot_of(vec![sleeper("a")]);
        pilot.start().await.expect("start");
        let err = pilot
            .register_plugins([Arc::new(NoopPlugin) as Arc<dyn PilotPlugin>])
            .expect_err("late registration");
        assert!(matches!(err, PilotError::AlreadyStarted));
        pilot.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn unknown_capability_fails_start_before_any_spawn() {
        let mut spec = sleeper("a");
        spec.ready_strategy = Some("healthz".to_string());
        spec.ready_timeout_sec = Some(1.0);
        let mut pilot = pilot_of(vec![spec]);
        let err = pilot.start().await.expect_err("unresolved strategy");
        assert!(matches!(err, PilotError::Manifest(_)));
    }

    #[tokio::test]
    async fn restart_of_unknown_process_has_no_side_effects() {
        let mut pilot = pilot_of(vec![sleeper("a")]);
        pilot.start().await.expect("start");
        let err = pilot
            .restart_processes(&["ghost".to_string()])
            .await
            .expect_err("unknown process");
        assert!(matches!(err, PilotError::UnknownProcess(_)));
        pilot.stop().await.expect("stop");
    }
}
