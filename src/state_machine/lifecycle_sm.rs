//! Runtime lifecycle state machine.
//!
//! Hierarchy:
//! ```text
//! Uninitialized ─► Created ─┬─► Restoring ─┬─► Resuming ─► Running
//!                           │              └─(restore failed)─┐
//!                           └─► Starting ◄────────────────────┘
//!                                  └─► Running
//! Running ─► TerminatingWithSave ─► Pausing ─► Saving ─► Stopped
//! Running ─(guest stopped)─► Stopped
//! Stopped | Failed ─► Created           (relaunch)
//!
//! tracked (superstate of everything except Failed) ──Fail──► Failed { report }
//! ```
//!
//! Save/restore is only entered when the host supports it; the flag lives in
//! the machine storage and is fixed at construction.

use statig::prelude::*;
use tracing::{debug, error, info};

use crate::error::FailureReport;
use crate::vm::lifecycle::LifecycleState;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Identity loaded, configuration validated, engine instance created.
    InstanceCreated,
    /// A saved state exists and will be restored.
    RestoreRequested,
    /// Cold start.
    StartRequested,
    Restored,
    RestoreFailed,
    Resumed,
    Started,
    /// The process wants to exit.
    TerminationRequested,
    PauseBegun,
    Paused,
    Saved,
    /// The guest shut itself down.
    GuestStopped,
    Fail(FailureReport),
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LifecycleMachine {
    pub save_restore_supported: bool,
}

impl LifecycleMachine {
    pub fn new(save_restore_supported: bool) -> Self {
        Self {
            save_restore_supported,
        }
    }

    pub fn ui_state(state: &State) -> LifecycleState {
        match state {
            State::Uninitialized {} => LifecycleState::Uninitialized,
            State::Created {} => LifecycleState::Created,
            State::Starting {} => LifecycleState::Starting,
            State::Running {} => LifecycleState::Running,
            State::Pausing {} => LifecycleState::Pausing,
            State::Saving {} => LifecycleState::Saving,
            State::Stopped {} => LifecycleState::Stopped,
            State::Restoring {} => LifecycleState::Restoring,
            State::Resuming {} => LifecycleState::Resuming,
            State::TerminatingWithSave {} => LifecycleState::TerminatingWithSave,
            State::Failed { report } => LifecycleState::Failed(report.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::uninitialized()",
    state(derive(Debug, Clone, PartialEq))
)]
impl LifecycleMachine {
    #[superstate]
    fn tracked(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Fail(report) => {
                error!(target: "lifecycle", kind = %report.kind, "lifecycle failed: {}", report.message);
                Transition(State::failed(report.clone()))
            }
            other => {
                debug!(target: "lifecycle", event = ?other, "event ignored in current state");
                Handled
            }
        }
    }

    #[state(superstate = "tracked")]
    fn uninitialized(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::InstanceCreated => Transition(State::created()),
            _ => Super,
        }
    }

    #[state(superstate = "tracked")]
    fn created(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::RestoreRequested if self.save_restore_supported => {
                Transition(State::restoring())
            }
            LifecycleEvent::StartRequested => Transition(State::starting()),
            _ => Super,
        }
    }

    #[state(superstate = "tracked")]
    fn restoring(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Restored => Transition(State::resuming()),
            LifecycleEvent::RestoreFailed => Transition(State::starting()),
            _ => Super,
        }
    }

    #[state(superstate = "tracked")]
    fn resuming(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Resumed => Transition(State::running()),
            _ => Super,
        }
    }

    #[state(superstate = "tracked")]
    fn starting(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Started => Transition(State::running()),
            _ => Super,
        }
    }

    #[state(superstate = "tracked", entry_action = "enter_running")]
    fn running(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::TerminationRequested if self.save_restore_supported => {
                Transition(State::terminating_with_save())
            }
            LifecycleEvent::GuestStopped => Transition(State::stopped()),
            _ => Super,
        }
    }

    #[state(superstate = "tracked")]
    fn terminating_with_save(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::PauseBegun => Transition(State::pausing()),
            _ => Super,
        }
    }

    #[state(superstate = "tracked")]
    fn pausing(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Paused => Transition(State::saving()),
            _ => Super,
        }
    }

    #[state(superstate = "tracked")]
    fn saving(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Saved => Transition(State::stopped()),
            _ => Super,
        }
    }

    #[state(superstate = "tracked", entry_action = "enter_stopped")]
    fn stopped(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::InstanceCreated => Transition(State::created()),
            _ => Super,
        }
    }

    #[state]
    fn failed(&mut self, event: &LifecycleEvent, report: &FailureReport) -> Outcome<State> {
        let _ = report;
        match event {
            LifecycleEvent::InstanceCreated => Transition(State::created()),
            _ => Handled,
        }
    }

    #[action]
    fn enter_running(&mut self) {
        info!(target: "lifecycle", "virtual machine running");
    }

    #[action]
    fn enter_stopped(&mut self) {
        info!(target: "lifecycle", "virtual machine stopped");
    }
}
