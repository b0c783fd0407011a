//! vmbundle-install: first-time setup of a VM bundle.
//!
//! With no argument the latest supported restore image is downloaded into
//! the bundle; with one argument that file is installed in place.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use vmbundle::logging;
use vmbundle::settings::SettingsArgs;
use vmbundle::vm::engine::UnavailableEngine;
use vmbundle::vm::installer::{InstallSource, InstallationState, Installer};

/// Install a macOS guest into a new VM bundle
#[derive(Parser, Debug)]
#[command(name = "vmbundle-install", version)]
struct Args {
    /// Restore image (.ipsw) to install; omit to download the latest
    ipsw: Option<PathBuf>,

    #[command(flatten)]
    settings: SettingsArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _log = logging::init();

    let settings = match args.settings.resolve().context("cannot resolve settings") {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let mut installer = match Installer::new(Arc::new(UnavailableEngine), &settings) {
        Ok(installer) => installer,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(e.kind().exit_code());
        }
    };

    let mut states = installer.subscribe();
    let reporter = tokio::spawn(async move {
        let mut last_decile = None;
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            match state {
                InstallationState::FetchingImage(p) | InstallationState::Installing(p) => {
                    let decile = (p * 10.0).floor() as u8;
                    if last_decile != Some(decile) {
                        last_decile = Some(decile);
                        info!("{state:?}: {:.0}%", p * 100.0);
                    }
                }
                other => {
                    last_decile = None;
                    info!("{other:?}");
                    if other.is_terminal() {
                        break;
                    }
                }
            }
        }
    });

    let source = args
        .ipsw
        .map_or(InstallSource::Fetch, InstallSource::Local);
    let result = installer.install(source).await;
    drop(installer);
    let _ = reporter.await;

    match result {
        Ok(()) => {
            info!(bundle = %settings.bundle_path.display(), "installation complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(kind = %e.kind(), "{e}");
            if e.is_recoverable() {
                warn!("fix the input above and run vmbundle-install again");
            }
            ExitCode::from(e.kind().exit_code())
        }
    }
}
