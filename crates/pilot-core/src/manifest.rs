//! Manifest model: one `ProcessSpec` per managed program, loaded from
//! JSON or YAML with a strict schema, validated before anything runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ManifestError;
use crate::schedule::{self, StartPlan};
use crate::types::{BuiltinStrategy, ShutdownStrategy};

// ─── Ready params ────────────────────────────────────────────────

pub const PARAM_PORT: &str = "port";
pub const PARAM_HOST: &str = "host";
pub const PARAM_PATH: &str = "path";

// ─── Process spec ────────────────────────────────────────────────

/// Declarative description of one managed process. Immutable once the
/// manifest is validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessSpec {
    pub name: String,
    /// Absolute path or PATH-resolvable executable.
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Merged over the supervisor's inherited environment; entries win.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Seconds granted to a graceful stop before force-kill.
    pub timeout: f64,
    #[serde(default)]
    pub shutdown_strategy: ShutdownStrategy,
    #[serde(default)]
    pub ready_strategy: Option<String>,
    #[serde(default)]
    pub ready_timeout_sec: Option<f64>,
    #[serde(default)]
    pub ready_params: BTreeMap<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Hook-group names resolved in the plugin registry.
    #[serde(default)]
    pub hooks: Vec<String>,
    /// Stats-handler names resolved in the plugin registry.
    #[serde(default)]
    pub stats_handlers: Vec<String>,
}

impl ProcessSpec {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.ready_params.get(key).and_then(Value::as_str)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.ready_params.get(key).and_then(Value::as_u64)
    }

    /// Graceful-stop budget. Valid only on a validated spec.
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.max(0.0))
    }

    /// Readiness budget, present iff a strategy is declared.
    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_sec
            .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
    }

    fn validate(&self) -> Result<(), ManifestError> {
        let invalid = |field: &'static str, detail: String| ManifestError::InvalidField {
            process: self.name.clone(),
            field,
            detail,
        };

        if self.name.is_empty() {
            return Err(ManifestError::InvalidField {
                process: "<unnamed>".to_string(),
                field: "name",
                detail: "must not be empty".to_string(),
            });
        }
        if self.path.is_empty() {
            return Err(invalid("path", "must not be empty".to_string()));
        }
        if !self.timeout.is_finite() || self.timeout < 0.0 {
            return Err(invalid(
                "timeout",
                format!("must be a finite number >= 0, got {}", self.timeout),
            ));
        }

        match (&self.ready_strategy, self.ready_timeout_sec) {
            (Some(_), None) => {
                return Err(invalid(
                    "ready_timeout_sec",
                    "required when ready_strategy is set".to_string(),
                ));
            }
            (Some(_), Some(secs)) if !secs.is_finite() || secs <= 0.0 => {
                return Err(invalid(
                    "ready_timeout_sec",
                    format!("must be a finite number > 0, got {secs}"),
                ));
            }
            (None, Some(_)) => {
                return Err(invalid(
                    "ready_timeout_sec",
                    "only meaningful together with ready_strategy".to_string(),
                ));
            }
            _ => {}
        }

        if let Some(strategy) = self
            .ready_strategy
            .as_deref()
            .and_then(BuiltinStrategy::from_name)
        {
            self.validate_builtin_params(strategy)?;
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if !seen.insert(dep.as_str()) {
                return Err(invalid(
                    "dependencies",
                    format!("duplicate dependency '{dep}'"),
                ));
            }
        }

        Ok(())
    }

    fn validate_builtin_params(&self, strategy: BuiltinStrategy) -> Result<(), ManifestError> {
        let missing = |param: &'static str| ManifestError::MissingReadyParam {
            process: self.name.clone(),
            strategy: strategy.to_string(),
            param,
        };
        let invalid = |field: &'static str, detail: String| ManifestError::InvalidField {
            process: self.name.clone(),
            field,
            detail,
        };

        match strategy {
            BuiltinStrategy::Tcp => {
                let port = self.ready_params.get(PARAM_PORT).ok_or_else(|| missing(PARAM_PORT))?;
                match port.as_u64() {
                    Some(p) if (1..=65535).contains(&p) => {}
                    _ => {
                        return Err(invalid(
                            "ready_params.port",
                            format!("must be an integer in 1..=65535, got {port}"),
                        ));
                    }
                }
                if let Some(host) = self.ready_params.get(PARAM_HOST) {
                    if host.as_str().is_none_or(str::is_empty) {
                        return Err(invalid(
                            "ready_params.host",
                            "must be a non-empty string".to_string(),
                        ));
                    }
                }
            }
            BuiltinStrategy::File => {
                let path = self
                    .param_str(PARAM_PATH)
                    .ok_or_else(|| missing(PARAM_PATH))?;
                if !Path::new(path).is_absolute() {
                    return Err(invalid(
                        "ready_params.path",
                        format!("must be an absolute path, got '{path}'"),
                    ));
                }
            }
            BuiltinStrategy::Pipe => {
                let path = self
                    .param_str(PARAM_PATH)
                    .ok_or_else(|| missing(PARAM_PATH))?;
                if path.is_empty() {
                    return Err(invalid(
                        "ready_params.path",
                        "must be a non-empty pipe name".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl ProcessSpec {
    /// Minimal valid spec for tests; override fields as needed.
    pub(crate) fn stub() -> Self {
        Self {
            name: "stub".to_string(),
            path: "/bin/true".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            timeout: 1.0,
            shutdown_strategy: ShutdownStrategy::default(),
            ready_strategy: None,
            ready_timeout_sec: None,
            ready_params: BTreeMap::new(),
            dependencies: Vec::new(),
            hooks: Vec::new(),
            stats_handlers: Vec::new(),
        }
    }
}

// ─── Manifest ────────────────────────────────────────────────────

/// Top-level manifest document as it appears on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestDoc {
    processes: Vec<ProcessSpec>,
}

/// Validated manifest: ordered specs plus the precomputed start plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessManifest {
    specs: Vec<ProcessSpec>,
    index: HashMap<String, usize>,
    plan: StartPlan,
}

impl ProcessManifest {
    /// Validate specs and derive the start plan. This enforces every
    /// structural invariant: unique non-empty names, known
    /// dependencies, acyclic graph, well-formed timeouts and ready
    /// params. Capability references are checked separately against a
    /// registry, since plugins may be registered after construction.
    pub fn new(specs: Vec<ProcessSpec>) -> Result<Self, ManifestError> {
        let mut index = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            spec.validate()?;
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(ManifestError::DuplicateName(spec.name.clone()));
            }
        }
        let plan = schedule::plan(&specs)?;
        Ok(Self { specs, index, plan })
    }

    pub fn from_json_str(input: &str) -> Result<Self, ManifestError> {
        let doc: ManifestDoc = serde_json::from_str(input)
            .map_err(|e| ManifestError::SchemaViolation(e.to_string()))?;
        Self::new(doc.processes)
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, ManifestError> {
        let doc: ManifestDoc = serde_yaml::from_str(input)
            .map_err(|e| ManifestError::SchemaViolation(e.to_string()))?;
        Self::new(doc.processes)
    }

    /// Load a manifest file, picking the parser from the extension.
    /// Unknown extensions are tried as JSON first, then YAML.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ManifestError::Unreadable {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&raw),
            _ => Self::from_json_str(&raw).or_else(|_| Self::from_yaml_str(&raw)),
        }
    }

    pub fn specs(&self) -> &[ProcessSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&ProcessSpec> {
        self.index.get(name).map(|&i| &self.specs[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn plan(&self) -> &StartPlan {
        &self.plan
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
