//! vmbundle: run an installed VM bundle.
//!
//! Launches the guest (restoring its saved state when there is one), waits
//! for Ctrl-C or for the guest to stop on its own, and on Ctrl-C pauses and
//! saves the guest before exiting so the next launch resumes where it was.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use vmbundle::logging;
use vmbundle::settings::SettingsArgs;
use vmbundle::vm::engine::UnavailableEngine;
use vmbundle::vm::lifecycle::{LifecycleManager, LifecycleState, TerminationDecision};

/// Run an installed macOS guest VM bundle
#[derive(Parser, Debug)]
#[command(name = "vmbundle", version)]
struct Args {
    #[command(flatten)]
    settings: SettingsArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _log = logging::init();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let settings = args
        .settings
        .resolve()
        .context("cannot resolve settings")?;

    let manager = LifecycleManager::new(Arc::new(UnavailableEngine), &settings);
    info!(
        bundle = %settings.bundle_path.display(),
        save_restore = manager.save_restore_supported(),
        "launching"
    );

    if let Err(e) = manager.launch().await {
        error!(kind = %e.kind(), "{e}");
        if e.is_fatal_for_bundle() {
            warn!("the bundle cannot be launched; reinstall it with vmbundle-install");
        }
        return Ok(ExitCode::from(e.kind().exit_code()));
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("cannot listen for Ctrl-C")?;
            info!("interrupt received");
        }
        state = manager.wait_until_stopped() => {
            return Ok(match state {
                LifecycleState::Failed(report) => {
                    error!("{report}");
                    ExitCode::from(report.kind.exit_code())
                }
                _ => ExitCode::SUCCESS,
            });
        }
    }

    match manager.request_termination().await {
        TerminationDecision::ExitNow => Ok(ExitCode::SUCCESS),
        TerminationDecision::ExitLater(handle) => {
            info!("saving machine state before exit");
            match handle.wait().await {
                Ok(()) => Ok(ExitCode::SUCCESS),
                Err(e) => {
                    error!(kind = %e.kind(), "{e}");
                    Ok(ExitCode::from(e.kind().exit_code()))
                }
            }
        }
    }
}
