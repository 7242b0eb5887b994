//! Rendering the dependency graph to an image through the external
//! graphviz `dot` binary.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use pilot_core::ProcessManifest;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum GraphFormat {
    Png,
    Svg,
    Pdf,
}

impl GraphFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Svg => "svg",
            Self::Pdf => "pdf",
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to run '{bin}': {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("graph renderer failed: {stderr}")]
    Tool { stderr: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Executes a DOT-to-image conversion. Trait-shaped so tests run
/// without graphviz installed.
pub trait DotRunner: Send + Sync {
    fn render(&self, dot: &str, format: GraphFormat, output: &Path) -> Result<(), RenderError>;
}

/// Real renderer shelling out to graphviz.
pub struct GraphvizRunner {
    dot_bin: String,
}

impl GraphvizRunner {
    pub fn new(dot_bin: impl Into<String>) -> Self {
        Self {
            dot_bin: dot_bin.into(),
        }
    }
}

impl Default for GraphvizRunner {
    fn default() -> Self {
        Self::new("dot")
    }
}

impl DotRunner for GraphvizRunner {
    fn render(&self, dot: &str, format: GraphFormat, output: &Path) -> Result<(), RenderError> {
        let mut child = Command::new(&self.dot_bin)
            .arg(format!("-T{}", format.extension()))
            .arg("-o")
            .arg(output)
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RenderError::Spawn {
                bin: self.dot_bin.clone(),
                source,
            })?;
        // stdin must be closed before waiting, or dot never sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(dot.as_bytes())?;
        }
        let result = child.wait_with_output()?;
        if !result.status.success() {
            return Err(RenderError::Tool {
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Generate DOT for the manifest and render it into `output_dir`.
/// `detailed` is honored only for svg output.
pub fn render_graph(
    manifest: &ProcessManifest,
    format: GraphFormat,
    output_dir: &Path,
    detailed: bool,
    runner: &dyn DotRunner,
) -> Result<PathBuf, RenderError> {
    let effective_detailed = detailed && format == GraphFormat::Svg;
    if detailed && !effective_detailed {
        warn!("--detailed is only honored for svg output; ignoring");
    }
    let dot = pilot_core::graph::to_dot(manifest, effective_detailed);
    let output = output_dir.join(format!("process_graph.{}", format.extension()));
    runner.render(&dot, format, &output)?;
    Ok(output)
}
