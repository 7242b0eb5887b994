//! Error kinds for manifest validation, registry lookups, and the
//! supervisor façade.

use std::fmt;

use thiserror::Error;

use crate::types::HookKind;

/// Which capability table a registry name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Plugin,
    Strategy,
    HookGroup,
    StatsHandler,
}

impl CapabilityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plugin => "plugin",
            Self::Strategy => "ready strategy",
            Self::HookGroup => "hook group",
            Self::StatsHandler => "stats handler",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manifest rejected before any process was started. No cleanup is
/// ever required for these.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {detail}")]
    Unreadable { path: String, detail: String },

    #[error("manifest schema violation: {0}")]
    SchemaViolation(String),

    #[error("duplicate process name '{0}'")]
    DuplicateName(String),

    #[error("process '{process}' depends on unknown process '{dependency}'")]
    UnknownDependency { process: String, dependency: String },

    #[error("dependency cycle involving {0:?}")]
    CycleDetected(Vec<String>),

    #[error("process '{process}' references unknown {kind} '{name}'")]
    UnknownCapability {
        process: String,
        kind: CapabilityKind,
        name: String,
    },

    #[error("ready strategy '{strategy}' on process '{process}' requires param '{param}'")]
    MissingReadyParam {
        process: String,
        strategy: String,
        param: &'static str,
    },

    #[error("invalid {field} on process '{process}': {detail}")]
    InvalidField {
        process: String,
        field: &'static str,
        detail: String,
    },
}

/// Registration or lookup failure in the plugin registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("duplicate registration of {kind} '{name}'")]
    DuplicateRegistration { kind: CapabilityKind, name: String },

    #[error("unknown {kind} '{name}'")]
    UnknownCapability { kind: CapabilityKind, name: String },
}

/// Where a plugin callable was executing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStage {
    Hook(HookKind),
    Probe,
    StatsHandler,
}

impl fmt::Display for PluginStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hook(kind) => write!(f, "{kind} hook"),
            Self::Probe => f.write_str("readiness probe"),
            Self::StatsHandler => f.write_str("stats handler"),
        }
    }
}

/// A plugin callable failed. Fatal only during pre-start; everywhere
/// else it is logged and supervision continues.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("plugin hook group '{group}' failed in {stage}: {message}")]
pub struct PluginError {
    pub group: String,
    pub stage: PluginStage,
    pub message: String,
}

/// Top-level error surface of the supervisor façade.
#[derive(Debug, Error)]
pub enum PilotError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("startup of process '{process}' failed: {reason}")]
    StartupFailure { process: String, reason: String },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("unknown process '{0}'")]
    UnknownProcess(String),

    #[error("process '{0}' is not running")]
    NotRunning(String),

    #[error("supervisor already started")]
    AlreadyStarted,

    #[error("supervisor not started")]
    NotStarted,

    #[error("supervisor internal error: {0}")]
    Internal(String),
}

impl PilotError {
    /// Process exit code the CLI maps this error to.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Manifest(_) | Self::Registry(_) => 1,
            Self::StartupFailure { .. } | Self::Plugin(_) => 2,
            Self::UnknownProcess(_)
            | Self::NotRunning(_)
            | Self::AlreadyStarted
            | Self::NotStarted
            | Self::Internal(_) => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_errors_render_the_offender() {
        let err = ManifestError::UnknownDependency {
            process: "api".into(),
            dependency: "db".into(),
        };
        assert_eq!(
            err.to_string(),
            "process 'api' depends on unknown process 'db'"
        );
    }

    #[test]
    fn plugin_stage_display() {
        assert_eq!(
            PluginStage::Hook(HookKind::PreStart).to_string(),
            "pre_start hook"
        );
        assert_eq!(PluginStage::StatsHandler.to_string(), "stats handler");
    }

    #[test]
    fn exit_codes_follow_failure_class() {
        let manifest: PilotError = ManifestError::DuplicateName("a".into()).into();
        assert_eq!(manifest.exit_code(), 1);
        let startup = PilotError::StartupFailure {
            process: "a".into(),
            reason: "never became ready".into(),
        };
        assert_eq!(startup.exit_code(), 2);
        assert_eq!(PilotError::AlreadyStarted.exit_code(), 3);
    }
}
