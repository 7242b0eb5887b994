//! Supervisor entry point.
//!
//! Exit codes: 0 clean stop, 1 manifest validation failure,
//! 2 startup failure, 3 unexpected internal error.

use std::process::ExitCode;

use clap::Parser;
use pilot_core::ProcessManifest;
use pilot_runtime::cli::{self, PilotCli};
use pilot_runtime::{MonitorExit, PilotOptions, ProcessPilot};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = PilotCli::parse();
    cli::init_tracing();

    let manifest = match ProcessManifest::load(&args.manifest) {
        Ok(manifest) => manifest,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(1);
        }
    };
    if let Some(dir) = &args.plugins {
        warn!(
            "--plugins {} ignored: plugin discovery is delegated to an external loader",
            dir.display()
        );
    }

    info!(
        manifest = %args.manifest.display(),
        processes = manifest.len(),
        "process-pilot starting"
    );
    let pilot = ProcessPilot::new(manifest, PilotOptions::default());
    match pilot.run().await {
        Ok(MonitorExit::InternalError(detail)) => {
            error!(%detail, "supervision ended abnormally");
            ExitCode::from(3)
        }
        Ok(exit) => {
            info!(?exit, "process-pilot stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}
