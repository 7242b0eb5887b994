//! CLI definitions and logging setup for the two binaries.

use std::path::PathBuf;

use clap::Parser;

use crate::graph_render::GraphFormat;

#[derive(Parser)]
#[command(
    name = "process-pilot",
    about = "dependency-aware process supervisor",
    version
)]
pub struct PilotCli {
    /// Manifest file (JSON or YAML).
    pub manifest: PathBuf,

    /// Plugin directory. Discovery is delegated to an external
    /// loader; the flag is accepted for interface compatibility.
    #[arg(long)]
    pub plugins: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "process-graph",
    about = "render the manifest dependency graph",
    version
)]
pub struct GraphCli {
    /// Manifest file (JSON or YAML).
    pub manifest: PathBuf,

    /// Output image format.
    #[arg(long, value_enum, default_value = "png")]
    pub format: GraphFormat,

    /// Directory the image is written into.
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Include command lines and policies in node labels (svg only).
    #[arg(long)]
    pub detailed: bool,
}

/// Install the fmt subscriber, filtered by PILOT_LOG / RUST_LOG.
pub fn init_tracing() {
    let filter = std::env::var("PILOT_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}
