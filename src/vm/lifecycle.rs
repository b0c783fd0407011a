//! Launch, suspend and resume of an installed bundle.
//!
//! ## Architecture
//!
//! ```text
//! LifecycleManager::launch()
//!     ├─► load identity, build + validate configuration, create instance
//!     ├─► saved state?  restore → resume       (save file deleted either way)
//!     │                 └─ restore failed → cold start
//!     ├─► otherwise     start
//!     └─► guest-stop watcher task  (Running → Stopped | Failed)
//!
//! LifecycleManager::request_termination()
//!     ├─► not Running, or no save/restore  → ExitNow
//!     └─► TerminatingWithSave → ExitLater(handle)
//!             └─► background task: pause → save → Stopped
//! ```
//!
//! The engine instance and the state machine sit behind one async mutex, so
//! engine operations never overlap. The background save task owns the lock
//! until it finishes, and keeps running if its handle is dropped.

use std::fmt;
use std::sync::Arc;

use statig::prelude::*;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, FailureReport, LifecycleError};
use crate::settings::Settings;
use crate::state_machine::lifecycle_sm::{LifecycleEvent, LifecycleMachine};
use crate::vm::bundle::BundleStore;
use crate::vm::config::build_configuration;
use crate::vm::engine::{GuestStop, HostCapabilities, Hypervisor, VirtualMachine};

/// Published lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Created,
    Starting,
    Running,
    Pausing,
    Saving,
    Stopped,
    Restoring,
    Resuming,
    TerminatingWithSave,
    Failed(FailureReport),
}

impl LifecycleState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Failed(_))
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Created => "created",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Pausing => "pausing",
            LifecycleState::Saving => "saving",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Restoring => "restoring",
            LifecycleState::Resuming => "resuming",
            LifecycleState::TerminatingWithSave => "terminating with save",
            LifecycleState::Failed(_) => "failed",
        };
        f.write_str(name)
    }
}

/// What the process should do after asking to terminate.
#[derive(Debug)]
pub enum TerminationDecision {
    /// Nothing to save; exit immediately.
    ExitNow,
    /// A save is in progress; exit once the handle resolves.
    ExitLater(TerminationHandle),
}

/// The background pause-and-save task.
#[derive(Debug)]
pub struct TerminationHandle {
    task: JoinHandle<Result<(), LifecycleError>>,
}

impl TerminationHandle {
    /// Wait for the save to finish. `Ok` means the save file is on disk.
    pub async fn wait(self) -> Result<(), LifecycleError> {
        self.task.await?
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Inner<M> {
    machine: StateMachine<LifecycleMachine>,
    vm: Option<M>,
    /// Bumped on every launch so a stale guest-stop watcher can tell its
    /// instance is gone.
    generation: u64,
}

struct Shared<H: Hypervisor> {
    engine: Arc<H>,
    store: BundleStore,
    desired_memory_gib: f64,
    capabilities: HostCapabilities,
    state_tx: watch::Sender<LifecycleState>,
    inner: Arc<Mutex<Inner<H::Machine>>>,
}

impl<H: Hypervisor> Shared<H> {
    fn dispatch(&self, machine: &mut StateMachine<LifecycleMachine>, event: LifecycleEvent) {
        machine.handle(&event);
        let next = LifecycleMachine::ui_state(machine.state());
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(target: "lifecycle", state = %next, "state changed");
            *current = next;
            true
        });
    }
}

fn current(machine: &StateMachine<LifecycleMachine>) -> LifecycleState {
    LifecycleMachine::ui_state(machine.state())
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct LifecycleManager<H: Hypervisor> {
    shared: Arc<Shared<H>>,
}

impl<H: Hypervisor> LifecycleManager<H> {
    pub fn new(engine: Arc<H>, settings: &Settings) -> Self {
        let capabilities = engine.capabilities();
        let (state_tx, _) = watch::channel(LifecycleState::Uninitialized);
        let inner = Inner {
            machine: LifecycleMachine::new(capabilities.save_restore_supported).state_machine(),
            vm: None,
            generation: 0,
        };
        Self {
            shared: Arc::new(Shared {
                engine,
                store: BundleStore::new(settings.layout()),
                desired_memory_gib: settings.memory_gib,
                capabilities,
                state_tx,
                inner: Arc::new(Mutex::new(inner)),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.shared.state_tx.subscribe()
    }

    pub fn store(&self) -> &BundleStore {
        &self.shared.store
    }

    pub fn save_restore_supported(&self) -> bool {
        self.shared.capabilities.save_restore_supported
    }

    /// Wait until the machine is `Stopped` or `Failed`.
    pub async fn wait_until_stopped(&self) -> LifecycleState {
        let mut rx = self.subscribe();
        match rx.wait_for(LifecycleState::is_stopped).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Bring the machine to `Running`, restoring saved state when present.
    pub async fn launch(&self) -> Result<(), LifecycleError> {
        let shared = &self.shared;
        let mut guard = shared.inner.lock().await;

        let state = current(&guard.machine);
        if !matches!(
            state,
            LifecycleState::Uninitialized | LifecycleState::Stopped | LifecycleState::Failed(_)
        ) {
            return Err(LifecycleError::InvalidState {
                action: "launch",
                state: state.to_string(),
            });
        }

        guard.vm = None;
        guard.generation += 1;
        let generation = guard.generation;

        let result = self.launch_locked(&mut guard).await;
        match result {
            Ok(stops) => {
                if let Some(stops) = stops {
                    tokio::spawn(watch_guest(Arc::clone(shared), stops, generation));
                }
                Ok(())
            }
            Err(e) => {
                guard.vm = None;
                shared.dispatch(&mut guard.machine, LifecycleEvent::Fail(e.report()));
                Err(e)
            }
        }
    }

    async fn launch_locked(
        &self,
        inner: &mut Inner<H::Machine>,
    ) -> Result<Option<mpsc::UnboundedReceiver<GuestStop>>, LifecycleError> {
        let shared = &self.shared;
        let layout = shared.store.layout();
        let caps = &shared.capabilities;

        let identity = shared.store.load_identity(shared.engine.as_ref()).await?;
        let config = build_configuration(&identity, layout, caps, shared.desired_memory_gib)?;
        shared.engine.validate(&config)?;
        if caps.save_restore_supported {
            shared.engine.validate_save_restore(&config)?;
        }
        let mut vm = shared.engine.create_machine(config)?;
        let stops = vm.guest_stops();
        shared.dispatch(&mut inner.machine, LifecycleEvent::InstanceCreated);

        let mut cold_start = true;
        if caps.save_restore_supported && shared.store.has_saved_state().await {
            let saved = layout.saved_state_path();
            info!(target: "lifecycle", path = %saved.display(), "restoring saved state");
            shared.dispatch(&mut inner.machine, LifecycleEvent::RestoreRequested);

            let restored = vm.restore_state(&saved).await;
            shared.store.delete_saved_state().await?;

            match restored {
                Ok(()) => {
                    shared.dispatch(&mut inner.machine, LifecycleEvent::Restored);
                    vm.resume().await?;
                    shared.dispatch(&mut inner.machine, LifecycleEvent::Resumed);
                    cold_start = false;
                }
                Err(e) => {
                    warn!(target: "lifecycle", error = %e, "restore failed, starting fresh");
                    shared.dispatch(&mut inner.machine, LifecycleEvent::RestoreFailed);
                }
            }
        } else {
            shared.dispatch(&mut inner.machine, LifecycleEvent::StartRequested);
        }

        if cold_start {
            vm.start().await?;
            shared.dispatch(&mut inner.machine, LifecycleEvent::Started);
        }

        inner.vm = Some(vm);
        Ok(stops)
    }

    /// Decide whether the process may exit now or must wait for a save.
    pub async fn request_termination(&self) -> TerminationDecision {
        let shared = Arc::clone(&self.shared);

        // A launch holds the lock while starting or restoring; it must not
        // delay the answer.
        let published = self.state();
        if published != LifecycleState::Running {
            debug!(target: "lifecycle", state = %published, "nothing to save, exit now");
            return TerminationDecision::ExitNow;
        }

        let mut guard = Arc::clone(&shared.inner).lock_owned().await;

        if current(&guard.machine) != LifecycleState::Running {
            debug!(target: "lifecycle", state = %current(&guard.machine), "nothing to save, exit now");
            return TerminationDecision::ExitNow;
        }

        shared.dispatch(&mut guard.machine, LifecycleEvent::TerminationRequested);
        if current(&guard.machine) != LifecycleState::TerminatingWithSave {
            info!(target: "lifecycle", "save/restore unavailable, exit now");
            return TerminationDecision::ExitNow;
        }

        let task = tokio::spawn(async move {
            let result = save_and_stop(&shared, &mut guard).await;
            if let Err(e) = &result {
                guard.vm = None;
                shared.dispatch(&mut guard.machine, LifecycleEvent::Fail(e.report()));
                if let Err(cleanup) = shared.store.delete_saved_state().await {
                    warn!(target: "lifecycle", error = %cleanup, "could not remove partial save file");
                }
            }
            result
        });

        TerminationDecision::ExitLater(TerminationHandle { task })
    }
}

async fn save_and_stop<H: Hypervisor>(
    shared: &Shared<H>,
    guard: &mut OwnedMutexGuard<Inner<H::Machine>>,
) -> Result<(), LifecycleError> {
    let Inner { machine, vm, .. } = &mut **guard;
    let Some(running) = vm.as_mut() else {
        return Err(LifecycleError::InvalidState {
            action: "save",
            state: current(machine).to_string(),
        });
    };

    shared.dispatch(machine, LifecycleEvent::PauseBegun);
    running.pause().await?;
    shared.dispatch(machine, LifecycleEvent::Paused);

    let path = shared.store.layout().saved_state_path();
    running.save_state(&path).await?;
    info!(target: "lifecycle", path = %path.display(), "machine state saved");
    shared.dispatch(machine, LifecycleEvent::Saved);

    *vm = None;
    Ok(())
}

async fn watch_guest<H: Hypervisor>(
    shared: Arc<Shared<H>>,
    mut stops: mpsc::UnboundedReceiver<GuestStop>,
    generation: u64,
) {
    while let Some(stop) = stops.recv().await {
        let mut guard = shared.inner.lock().await;
        if guard.generation != generation {
            return;
        }
        if current(&guard.machine) != LifecycleState::Running {
            debug!(target: "lifecycle", stop = ?stop, "guest stop outside Running ignored");
            continue;
        }

        let Inner { machine, vm, .. } = &mut *guard;
        match stop {
            GuestStop::Normal => {
                info!(target: "lifecycle", "guest stopped");
                shared.dispatch(machine, LifecycleEvent::GuestStopped);
            }
            GuestStop::Error(message) => {
                let report = FailureReport::new(
                    ErrorKind::Engine,
                    format!("guest stopped with an error: {message}"),
                );
                shared.dispatch(machine, LifecycleEvent::Fail(report));
            }
        }
        *vm = None;
        return;
    }
}
