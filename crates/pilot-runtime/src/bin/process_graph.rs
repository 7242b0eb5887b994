//! Dependency-graph renderer. Reads only the manifest.
//!
//! Exit codes: 0 on success, 1 on validation or rendering failure.

use std::process::ExitCode;

use clap::Parser;
use pilot_core::ProcessManifest;
use pilot_runtime::cli::{self, GraphCli};
use pilot_runtime::graph_render::{self, GraphvizRunner};
use tracing::{error, info};

fn main() -> ExitCode {
    let args = GraphCli::parse();
    cli::init_tracing();

    let manifest = match ProcessManifest::load(&args.manifest) {
        Ok(manifest) => manifest,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(1);
        }
    };

    let runner = GraphvizRunner::default();
    match graph_render::render_graph(
        &manifest,
        args.format,
        &args.output_dir,
        args.detailed,
        &runner,
    ) {
        Ok(path) => {
            info!(output = %path.display(), "graph rendered");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::from(1)
        }
    }
}
