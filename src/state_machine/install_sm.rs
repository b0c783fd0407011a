//! Installation state machine.
//!
//! Strictly forward:
//! ```text
//! Idle ─┬─► FetchingImage { progress } ─┐
//!       └─► LoadingImage ───────────────┴─► Validating ─► ProvisioningStorage
//!               ─► Configuring ─► Installing { progress } ─► Succeeded
//!
//! every non-terminal state (superstate `active`) ──Fail──► Failed { report }
//! Failed ──Reset──► Idle
//! ```
//!
//! The machine only records where the pipeline is; the async driver in
//! `vm::installer` performs the work and feeds the results back as events.

use statig::prelude::*;
use tracing::{debug, info, warn};

use crate::error::FailureReport;
use crate::vm::installer::InstallationState;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum InstallEvent {
    /// Download of the latest image began.
    FetchStarted,
    /// Loading of a caller-supplied image began.
    LocalLoadStarted,
    /// Download progress fraction.
    DownloadProgress(f64),
    /// An image file is on disk and ready for the engine.
    ImageReady,
    /// The engine accepted the image for this host.
    Validated,
    /// Bundle, disk, auxiliary storage and identity are in place.
    StorageProvisioned,
    /// The configuration passed engine validation.
    Configured,
    /// Engine install progress fraction.
    InstallProgress(f64),
    InstallFinished,
    Fail(FailureReport),
    /// Leave `Failed` for another attempt.
    Reset,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InstallMachine;

impl InstallMachine {
    pub fn new() -> Self {
        Self
    }

    /// Public snapshot of a machine state.
    pub fn ui_state(state: &State) -> InstallationState {
        match state {
            State::Idle {} => InstallationState::Idle,
            State::FetchingImage { progress } => InstallationState::FetchingImage(*progress),
            State::LoadingImage {} => InstallationState::LoadingImage,
            State::Validating {} => InstallationState::Validating,
            State::ProvisioningStorage {} => InstallationState::ProvisioningStorage,
            State::Configuring {} => InstallationState::Configuring,
            State::Installing { progress } => InstallationState::Installing(*progress),
            State::Succeeded {} => InstallationState::Succeeded,
            State::Failed { report } => InstallationState::Failed(report.clone()),
        }
    }
}

/// Fold a new fraction into the current one without ever going backwards.
fn advance(current: f64, next: f64) -> f64 {
    if next.is_nan() {
        return current;
    }
    next.clamp(0.0, 1.0).max(current)
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::idle()",
    state(derive(Debug, Clone, PartialEq))
)]
impl InstallMachine {
    #[superstate]
    fn active(&mut self, event: &InstallEvent) -> Outcome<State> {
        match event {
            InstallEvent::Fail(report) => {
                warn!(target: "installer", kind = %report.kind, "installation failed: {}", report.message);
                Transition(State::failed(report.clone()))
            }
            other => {
                debug!(target: "installer", event = ?other, "event ignored in current state");
                Handled
            }
        }
    }

    #[state(superstate = "active")]
    fn idle(&mut self, event: &InstallEvent) -> Outcome<State> {
        match event {
            InstallEvent::FetchStarted => Transition(State::fetching_image(0.0)),
            InstallEvent::LocalLoadStarted => Transition(State::loading_image()),
            _ => Super,
        }
    }

    #[state(superstate = "active")]
    fn fetching_image(&mut self, event: &InstallEvent, progress: &f64) -> Outcome<State> {
        match event {
            InstallEvent::DownloadProgress(p) => {
                Transition(State::fetching_image(advance(*progress, *p)))
            }
            InstallEvent::ImageReady => Transition(State::validating()),
            _ => Super,
        }
    }

    #[state(superstate = "active")]
    fn loading_image(&mut self, event: &InstallEvent) -> Outcome<State> {
        match event {
            InstallEvent::ImageReady => Transition(State::validating()),
            _ => Super,
        }
    }

    #[state(superstate = "active", entry_action = "enter_validating")]
    fn validating(&mut self, event: &InstallEvent) -> Outcome<State> {
        match event {
            InstallEvent::Validated => Transition(State::provisioning_storage()),
            _ => Super,
        }
    }

    #[state(superstate = "active")]
    fn provisioning_storage(&mut self, event: &InstallEvent) -> Outcome<State> {
        match event {
            InstallEvent::StorageProvisioned => Transition(State::configuring()),
            _ => Super,
        }
    }

    #[state(superstate = "active")]
    fn configuring(&mut self, event: &InstallEvent) -> Outcome<State> {
        match event {
            InstallEvent::Configured => Transition(State::installing(0.0)),
            _ => Super,
        }
    }

    #[state(superstate = "active")]
    fn installing(&mut self, event: &InstallEvent, progress: &f64) -> Outcome<State> {
        match event {
            InstallEvent::InstallProgress(p) => {
                Transition(State::installing(advance(*progress, *p)))
            }
            InstallEvent::InstallFinished => Transition(State::succeeded()),
            _ => Super,
        }
    }

    /// Terminal.
    #[state(entry_action = "enter_succeeded")]
    fn succeeded(&mut self, event: &InstallEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    /// Terminal for the attempt; `Reset` allows a fresh one.
    #[state]
    fn failed(&mut self, event: &InstallEvent, report: &FailureReport) -> Outcome<State> {
        let _ = report;
        match event {
            InstallEvent::Reset => Transition(State::idle()),
            _ => Handled,
        }
    }

    #[action]
    fn enter_validating(&mut self) {
        info!(target: "installer", "validating restore image");
    }

    #[action]
    fn enter_succeeded(&mut self) {
        info!(target: "installer", "installation succeeded");
    }
}
