//! Hook-group invocation with the supervisor's failure semantics:
//! pre-start failures abort the start, everything else is logged and
//! swallowed so a broken plugin cannot take supervision down.

use std::sync::Arc;

use pilot_core::{ChildView, HookKind, PluginError, PluginRegistry, PluginStage, ProcessSpec};
use tracing::warn;

#[derive(Clone)]
pub struct HookEngine {
    registry: Arc<PluginRegistry>,
}

impl HookEngine {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Run every callable of `kind` across the spec's hook groups, in
    /// declaration order. Returns the first failure only for
    /// pre-start; other kinds always succeed from the caller's view.
    pub fn run(
        &self,
        spec: &ProcessSpec,
        kind: HookKind,
        view: &ChildView,
    ) -> Result<(), PluginError> {
        for group in &spec.hooks {
            let hooks = match self.registry.resolve_hooks(group, kind) {
                Ok(hooks) => hooks,
                Err(err) => {
                    // Validated at start; only reachable if a manifest
                    // bypassed validation.
                    warn!(process = %spec.name, %err, "hook group vanished");
                    continue;
                }
            };
            for hook in hooks {
                if let Err(message) = hook(view) {
                    let failure = PluginError {
                        group: group.clone(),
                        stage: PluginStage::Hook(kind),
                        message,
                    };
                    if kind == HookKind::PreStart {
                        return Err(failure);
                    }
                    warn!(process = %spec.name, error = %failure, "hook failed; continuing");
                }
            }
        }
        Ok(())
    }
}
