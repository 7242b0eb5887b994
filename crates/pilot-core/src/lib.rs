//! Core domain logic for process-pilot: manifest model and validation,
//! dependency scheduling, shutdown-policy decisions, plugin registry,
//! and dependency-graph DOT output.
//!
//! Everything here is synchronous and OS-free; the runtime crate owns
//! spawning, probing, and the monitor loop.

pub mod error;
pub mod graph;
pub mod manifest;
pub mod policy;
pub mod registry;
pub mod schedule;
pub mod types;

pub use error::{
    CapabilityKind, ManifestError, PilotError, PluginError, PluginStage, RegistryError,
};
pub use manifest::{ProcessManifest, ProcessSpec};
pub use policy::{ExitDisposition, SupervisionRecord};
pub use registry::{
    HookFn, HookSet, PilotPlugin, PluginRegistry, ProbeFn, ResolvedStrategy, StatsFn,
};
pub use schedule::StartPlan;
pub use types::{
    BuiltinStrategy, ChildView, HookKind, LifecycleState, ProcessStats, ShutdownStrategy,
};
