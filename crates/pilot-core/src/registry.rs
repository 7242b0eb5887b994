//! Plugin capability registry: hook groups, readiness strategies, and
//! stats handlers, keyed by plugin-provided names.
//!
//! The three built-in strategies are installed at construction as
//! tagged entries; everything else falls through to plugin callables.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CapabilityKind, ManifestError, RegistryError};
use crate::manifest::ProcessManifest;
use crate::types::{BuiltinStrategy, ChildView, HookKind, ProcessStats};

// ─── Callable types ──────────────────────────────────────────────

/// Lifecycle hook. Errors abort the start in pre-start; elsewhere they
/// are logged and swallowed.
pub type HookFn = Arc<dyn Fn(&ChildView) -> Result<(), String> + Send + Sync>;

/// Custom readiness probe: one poll attempt, true means ready.
pub type ProbeFn = Arc<dyn Fn(&ChildView, Duration) -> bool + Send + Sync>;

/// Per-tick stats consumer.
pub type StatsFn = Arc<dyn Fn(&[ProcessStats]) -> Result<(), String> + Send + Sync>;

/// Hook callables for one group, bucketed by transition.
#[derive(Default, Clone)]
pub struct HookSet {
    pub pre_start: Vec<HookFn>,
    pub post_start: Vec<HookFn>,
    pub on_shutdown: Vec<HookFn>,
    pub on_restart: Vec<HookFn>,
}

impl HookSet {
    pub fn of(&self, kind: HookKind) -> &[HookFn] {
        match kind {
            HookKind::PreStart => &self.pre_start,
            HookKind::PostStart => &self.post_start,
            HookKind::OnShutdown => &self.on_shutdown,
            HookKind::OnRestart => &self.on_restart,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pre_start.is_empty()
            && self.post_start.is_empty()
            && self.on_shutdown.is_empty()
            && self.on_restart.is_empty()
    }
}

// ─── Plugin interface ────────────────────────────────────────────

/// A plugin contributes capabilities under names of its choosing.
/// All callables run synchronously from the supervisor's perspective;
/// bounding long-running work is the plugin's responsibility.
pub trait PilotPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn hooks(&self) -> HashMap<String, HookSet> {
        HashMap::new()
    }

    fn strategies(&self) -> HashMap<String, ProbeFn> {
        HashMap::new()
    }

    fn stats_handlers(&self) -> HashMap<String, StatsFn> {
        HashMap::new()
    }
}

/// What a strategy name resolved to.
#[derive(Clone)]
pub enum ResolvedStrategy {
    Builtin(BuiltinStrategy),
    Custom(ProbeFn),
}

enum StrategyEntry {
    Builtin(BuiltinStrategy),
    Custom(ProbeFn),
}

// ─── Registry ────────────────────────────────────────────────────

/// Read-mostly capability store. Mutated only through registration,
/// which is legal until the supervisor starts.
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn PilotPlugin>>,
    hook_groups: HashMap<String, HookSet>,
    strategies: HashMap<String, StrategyEntry>,
    stats_handlers: HashMap<String, StatsFn>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        let mut strategies = HashMap::new();
        for builtin in BuiltinStrategy::ALL {
            strategies.insert(
                builtin.as_str().to_string(),
                StrategyEntry::Builtin(builtin),
            );
        }
        Self {
            plugins: HashMap::new(),
            hook_groups: HashMap::new(),
            strategies,
            stats_handlers: HashMap::new(),
        }
    }

    /// Register a plugin's capabilities.
    ///
    /// Re-registering the same plugin object is a no-op. A different
    /// plugin under an already-taken plugin or capability name fails
    /// with `DuplicateRegistration` and leaves the registry untouched.
    pub fn register(&mut self, plugin: Arc<dyn PilotPlugin>) -> Result<(), RegistryError> {
        let name = plugin.name().to_string();
        if let Some(existing) = self.plugins.get(&name) {
            if Arc::ptr_eq(existing, &plugin) {
                return Ok(());
            }
            return Err(RegistryError::DuplicateRegistration {
                kind: CapabilityKind::Plugin,
                name,
            });
        }

        let hooks = plugin.hooks();
        let strategies = plugin.strategies();
        let stats = plugin.stats_handlers();

        // Check every name before inserting anything so a rejected
        // registration has no partial effect.
        for group in hooks.keys() {
            if self.hook_groups.contains_key(group) {
                return Err(RegistryError::DuplicateRegistration {
                    kind: CapabilityKind::HookGroup,
                    name: group.clone(),
                });
            }
        }
        for strategy in strategies.keys() {
            if self.strategies.contains_key(strategy) {
                return Err(RegistryError::DuplicateRegistration {
                    kind: CapabilityKind::Strategy,
                    name: strategy.clone(),
                });
            }
        }
        for handler in stats.keys() {
            if self.stats_handlers.contains_key(handler) {
                return Err(RegistryError::DuplicateRegistration {
                    kind: CapabilityKind::StatsHandler,
                    name: handler.clone(),
                });
            }
        }

        self.hook_groups.extend(hooks);
        self.strategies
            .extend(strategies.into_iter().map(|(n, f)| (n, StrategyEntry::Custom(f))));
        self.stats_handlers.extend(stats);
        self.plugins.insert(name, plugin);
        Ok(())
    }

    /// Install a single stats handler outside the plugin interface.
    /// Used for the handlers the supervisor itself ships.
    pub fn register_stats_handler(
        &mut self,
        name: &str,
        handler: StatsFn,
    ) -> Result<(), RegistryError> {
        if self.stats_handlers.contains_key(name) {
            return Err(RegistryError::DuplicateRegistration {
                kind: CapabilityKind::StatsHandler,
                name: name.to_string(),
            });
        }
        self.stats_handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn resolve_strategy(&self, name: &str) -> Result<ResolvedStrategy, RegistryError> {
        match self.strategies.get(name) {
            Some(StrategyEntry::Builtin(builtin)) => Ok(ResolvedStrategy::Builtin(*builtin)),
            Some(StrategyEntry::Custom(probe)) => Ok(ResolvedStrategy::Custom(Arc::clone(probe))),
            None => Err(RegistryError::UnknownCapability {
                kind: CapabilityKind::Strategy,
                name: name.to_string(),
            }),
        }
    }

    pub fn resolve_hooks(&self, group: &str, kind: HookKind) -> Result<Vec<HookFn>, RegistryError> {
        self.hook_groups
            .get(group)
            .map(|set| set.of(kind).to_vec())
            .ok_or_else(|| RegistryError::UnknownCapability {
                kind: CapabilityKind::HookGroup,
                name: group.to_string(),
            })
    }

    pub fn resolve_stats(&self, name: &str) -> Result<StatsFn, RegistryError> {
        self.stats_handlers
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| RegistryError::UnknownCapability {
                kind: CapabilityKind::StatsHandler,
                name: name.to_string(),
            })
    }

    pub fn has_strategy(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    pub fn has_hook_group(&self, name: &str) -> bool {
        self.hook_groups.contains_key(name)
    }

    pub fn has_stats_handler(&self, name: &str) -> bool {
        self.stats_handlers.contains_key(name)
    }

    /// Check that every capability a manifest references exists here.
    /// Runs at supervisor start, after all plugins are registered.
    pub fn validate_manifest(&self, manifest: &ProcessManifest) -> Result<(), ManifestError> {
        for spec in manifest.specs() {
            if let Some(strategy) = &spec.ready_strategy {
                if !self.has_strategy(strategy) {
                    return Err(ManifestError::UnknownCapability {
                        process: spec.name.clone(),
                        kind: CapabilityKind::Strategy,
                        name: strategy.clone(),
                    });
                }
            }
            for group in &spec.hooks {
                if !self.has_hook_group(group) {
                    return Err(ManifestError::UnknownCapability {
                        process: spec.name.clone(),
                        kind: CapabilityKind::HookGroup,
                        name: group.clone(),
                    });
                }
            }
            for handler in &spec.stats_handlers {
                if !self.has_stats_handler(handler) {
                    return Err(ManifestError::UnknownCapability {
                        process: spec.name.clone(),
                        kind: CapabilityKind::StatsHandler,
                        name: handler.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ProcessSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestPlugin {
        name: &'static str,
        strategy: Option<&'static str>,
        hook_group: Option<&'static str>,
        handler: Option<&'static str>,
    }

    impl TestPlugin {
        fn named(name: &'static str) -> Self {
            Self {
                name,
                strategy: None,
                hook_group: None,
                handler: None,
            }
        }
    }

    impl PilotPlugin for TestPlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn hooks(&self) -> HashMap<String, HookSet> {
            self.hook_group
                .map(|group| {
                    let set = HookSet {
                        pre_start: vec![Arc::new(|_: &ChildView| Ok(())) as HookFn],
                        ..HookSet::default()
                    };
                    [(group.to_string(), set)].into_iter().collect()
                })
                .unwrap_or_default()
        }

        fn strategies(&self) -> HashMap<String, ProbeFn> {
            self.strategy
                .map(|name| {
                    let probe: ProbeFn = Arc::new(|_: &ChildView, _| true);
                    [(name.to_string(), probe)].into_iter().collect()
                })
                .unwrap_or_default()
        }

        fn stats_handlers(&self) -> HashMap<String, StatsFn> {
            self.handler
                .map(|name| {
                    let handler: StatsFn = Arc::new(|_: &[ProcessStats]| Ok(()));
                    [(name.to_string(), handler)].into_iter().collect()
                })
                .unwrap_or_default()
        }
    }

    #[test]
    fn builtins_are_preinstalled() {
        let registry = PluginRegistry::new();
        for name in ["tcp", "file", "pipe"] {
            assert!(registry.has_strategy(name), "{name} should be built in");
        }
        assert!(matches!(
            registry.resolve_strategy("tcp"),
            Ok(ResolvedStrategy::Builtin(BuiltinStrategy::Tcp))
        ));
    }

    #[test]
    fn custom_strategy_resolves_to_its_callable() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(TestPlugin {
                strategy: Some("healthz"),
                ..TestPlugin::named("probes")
            }))
            .expect("register");
        match registry.resolve_strategy("healthz").expect("resolve") {
            ResolvedStrategy::Custom(probe) => {
                let view = ChildView {
                    name: "x".into(),
                    pid: None,
                    state: crate::types::LifecycleState::Starting,
                    restarts: 0,
                    ready_params: Default::default(),
                };
                assert!(probe(&view, Duration::from_millis(100)));
            }
            ResolvedStrategy::Builtin(_) => panic!("expected custom strategy"),
        }
    }

    #[test]
    fn shadowing_a_builtin_strategy_is_rejected() {
        let mut registry = PluginRegistry::new();
        let err = registry
            .register(Arc::new(TestPlugin {
                strategy: Some("tcp"),
                ..TestPlugin::named("rogue")
            }))
            .expect_err("builtin collision");
        assert_eq!(
            err,
            RegistryError::DuplicateRegistration {
                kind: CapabilityKind::Strategy,
                name: "tcp".to_string(),
            }
        );
    }

    #[test]
    fn reregistering_the_same_object_is_idempotent() {
        let mut registry = PluginRegistry::new();
        let plugin: Arc<dyn PilotPlugin> = Arc::new(TestPlugin {
            strategy: Some("healthz"),
            ..TestPlugin::named("probes")
        });
        registry.register(Arc::clone(&plugin)).expect("first");
        registry.register(plugin).expect("second is a no-op");
        assert!(registry.has_strategy("healthz"));
    }

    #[test]
    fn different_plugin_under_taken_name_is_rejected() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(TestPlugin::named("dup")))
            .expect("first");
        let err = registry
            .register(Arc::new(TestPlugin::named("dup")))
            .expect_err("second object, same name");
        assert_eq!(
            err,
            RegistryError::DuplicateRegistration {
                kind: CapabilityKind::Plugin,
                name: "dup".to_string(),
            }
        );
    }

    #[test]
    fn rejected_registration_leaves_no_partial_state() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(TestPlugin {
                hook_group: Some("web"),
                ..TestPlugin::named("first")
            }))
            .expect("first");
        // Second plugin carries a fresh handler name plus a colliding
        // hook group; nothing of it may land.
        registry
            .register(Arc::new(TestPlugin {
                hook_group: Some("web"),
                handler: Some("csv"),
                ..TestPlugin::named("second")
            }))
            .expect_err("collision");
        assert!(!registry.has_stats_handler("csv"));
    }

    #[test]
    fn unknown_lookups_fail() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.resolve_strategy("ghost"),
            Err(RegistryError::UnknownCapability {
                kind: CapabilityKind::Strategy,
                ..
            })
        ));
        assert!(registry.resolve_hooks("ghost", HookKind::PreStart).is_err());
        assert!(registry.resolve_stats("ghost").is_err());
    }

    #[test]
    fn hooks_resolve_per_kind() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(TestPlugin {
                hook_group: Some("web"),
                ..TestPlugin::named("hooks")
            }))
            .expect("register");
        assert_eq!(
            registry
                .resolve_hooks("web", HookKind::PreStart)
                .expect("resolve")
                .len(),
            1
        );
        assert!(registry
            .resolve_hooks("web", HookKind::OnShutdown)
            .expect("resolve")
            .is_empty());
    }

    #[test]
    fn stats_handler_callables_fire() {
        let mut registry = PluginRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        registry
            .register_stats_handler(
                "count",
                Arc::new(move |batch: &[ProcessStats]| {
                    counted.fetch_add(batch.len(), Ordering::SeqCst);
                    Ok(())
                }),
            )
            .expect("install");
        let handler = registry.resolve_stats("count").expect("resolve");
        let snapshot = ProcessStats {
            name: "svc".to_string(),
            pid: 7,
            memory_mb: 1.0,
            cpu_percent: 0.0,
            num_threads: 1,
            num_children: 0,
            collected_at: chrono::Utc::now(),
        };
        handler(&[snapshot]).expect("one-element batch");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err =
            registry.register_stats_handler("count", Arc::new(|_: &[ProcessStats]| Ok(())));
        assert!(matches!(
            err,
            Err(RegistryError::DuplicateRegistration {
                kind: CapabilityKind::StatsHandler,
                ..
            })
        ));
    }

    #[test]
    fn manifest_capability_validation() {
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(TestPlugin {
                hook_group: Some("web"),
                handler: Some("csv"),
                ..TestPlugin::named("caps")
            }))
            .expect("register");

        let ok = ProcessManifest::new(vec![ProcessSpec {
            hooks: vec!["web".to_string()],
            stats_handlers: vec!["csv".to_string()],
            ..ProcessSpec::stub()
        }])
        .expect("manifest");
        registry.validate_manifest(&ok).expect("resolves");

        let missing = ProcessManifest::new(vec![ProcessSpec {
            hooks: vec!["ghost".to_string()],
            ..ProcessSpec::stub()
        }])
        .expect("manifest");
        let err = registry.validate_manifest(&missing).expect_err("unknown");
        assert!(matches!(
            err,
            ManifestError::UnknownCapability {
                kind: CapabilityKind::HookGroup,
                ..
            }
        ));
    }
}
