//! First-time installation of a guest into a fresh bundle.
//!
//! [`Installer::install`] runs one sequential pipeline and feeds each stage
//! into the [`InstallMachine`]; every transition is published on a
//! `watch` channel for whoever renders progress.
//!
//! ```text
//! install(source)
//!     ├─► image        fetch_latest() | load_local()
//!     ├─► validate     engine.load_restore_image() → hardware model + minimums
//!     ├─► provision    bundle dir, AuxiliaryStorage, Disk.img, identity
//!     ├─► configure    build_configuration() + guest minimums + engine validate
//!     └─► install      engine install, progress relayed 0.0 → 1.0
//! ```
//!
//! The identity is minted in the provision step and nowhere else. A failed
//! attempt can be retried only while no identity has been persisted.
//!
//! A download can be cancelled through [`Installer::cancellation_token`];
//! the attempt then ends `Failed` with a network cancellation. An attempt
//! whose future was dropped is recorded as interrupted on the next call.

use std::path::PathBuf;
use std::sync::Arc;

use statig::prelude::*;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FailureReport, InstallError, NetworkError, StorageError, ValidationError};
use crate::settings::Settings;
use crate::state_machine::install_sm::{InstallEvent, InstallMachine};
use crate::vm::bundle::{BundleStore, VmIdentity};
use crate::vm::config::{DISK_IMAGE_SIZE, build_configuration, check_guest_minimums};
use crate::vm::engine::{Hypervisor, VirtualMachine};
use crate::vm::restore_image::{ImageHandle, RestoreImageProvider};

/// Where the restore image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    /// Download the latest image the host supports.
    Fetch,
    /// Use an image file the caller already has.
    Local(PathBuf),
}

/// Published installation progress.
#[derive(Debug, Clone, PartialEq)]
pub enum InstallationState {
    Idle,
    /// Download fraction in `[0, 1]`.
    FetchingImage(f64),
    LoadingImage,
    Validating,
    ProvisioningStorage,
    Configuring,
    /// Install fraction in `[0, 1]`.
    Installing(f64),
    Succeeded,
    Failed(FailureReport),
}

impl InstallationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstallationState::Succeeded | InstallationState::Failed(_))
    }
}

pub struct Installer<H: Hypervisor> {
    engine: Arc<H>,
    store: BundleStore,
    provider: RestoreImageProvider<H>,
    desired_memory_gib: f64,
    machine: StateMachine<InstallMachine>,
    state_tx: watch::Sender<InstallationState>,
    cancel: CancellationToken,
}

impl<H: Hypervisor> Installer<H> {
    pub fn new(engine: Arc<H>, settings: &Settings) -> Result<Self, InstallError> {
        let layout = settings.layout();
        let provider =
            RestoreImageProvider::new(Arc::clone(&engine), layout.clone(), settings.image_url.clone())?;
        let (state_tx, _) = watch::channel(InstallationState::Idle);
        Ok(Self {
            engine,
            store: BundleStore::new(layout),
            provider,
            desired_memory_gib: settings.memory_gib,
            machine: InstallMachine::new().state_machine(),
            state_tx,
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> InstallationState {
        self.state_tx.borrow().clone()
    }

    /// Receive every published state change.
    pub fn subscribe(&self) -> watch::Receiver<InstallationState> {
        self.state_tx.subscribe()
    }

    pub fn store(&self) -> &BundleStore {
        &self.store
    }

    /// Whether a restore image download is still running, including one
    /// left over from an abandoned attempt that is shutting down.
    pub fn is_fetching(&self) -> bool {
        self.provider.is_fetching()
    }

    /// Cancelling this token stops the download of the current or next
    /// attempt. Tokens are single-use: after a cancelled attempt a fresh one
    /// must be taken.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one installation attempt to `Succeeded` or `Failed`.
    pub async fn install(&mut self, source: InstallSource) -> Result<(), InstallError> {
        match self.state() {
            InstallationState::Idle => {}
            InstallationState::Succeeded => {
                return Err(StorageError::AlreadyInstalled {
                    path: self.store.layout().root().to_path_buf(),
                }
                .into());
            }
            InstallationState::Failed(_) => self.dispatch(InstallEvent::Reset),
            abandoned => {
                // `install` holds `&mut self`, so a non-terminal state here
                // means the previous attempt's future was dropped mid-way.
                debug_assert!(!abandoned.is_terminal());
                warn!(target: "installer", state = ?abandoned, "previous attempt was interrupted");
                let interrupted = InstallError::Interrupted {
                    stage: format!("{abandoned:?}"),
                };
                self.dispatch(InstallEvent::Fail(interrupted.report()));
                self.dispatch(InstallEvent::Reset);
            }
        }

        info!(target: "installer", source = ?source, bundle = %self.store.layout().root().display(), "installation started");

        let result = self.run(source).await;
        if let Err(e) = &result {
            self.dispatch(InstallEvent::Fail(e.report()));
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        result
    }

    async fn run(&mut self, source: InstallSource) -> Result<(), InstallError> {
        if self.store.has_identity().await {
            return Err(StorageError::AlreadyInstalled {
                path: self.store.layout().root().to_path_buf(),
            }
            .into());
        }

        let image = self.obtain_image(source).await?;
        self.dispatch(InstallEvent::ImageReady);

        // Validating
        let restore = self.engine.load_restore_image(&image.path).await?;
        let requirements = restore
            .most_featureful_configuration
            .ok_or(ValidationError::NoSupportedConfiguration)?;
        if !self.engine.supports_hardware_model(&requirements.hardware_model) {
            return Err(ValidationError::Unsupported.into());
        }
        debug!(
            target: "installer",
            minimum_cpu_count = requirements.minimum_cpu_count,
            minimum_memory_size = requirements.minimum_memory_size,
            "image validated"
        );
        self.dispatch(InstallEvent::Validated);

        // ProvisioningStorage
        let layout = self.store.layout().clone();
        self.engine
            .create_auxiliary_storage(&layout.auxiliary_storage_path(), &requirements.hardware_model)
            .await?;
        self.store.provision_disk_image(DISK_IMAGE_SIZE).await?;
        let identity = VmIdentity {
            hardware_model: requirements.hardware_model.clone(),
            machine_identifier: self.engine.new_machine_identifier(),
        };
        self.store.persist_identity(&identity).await?;
        self.dispatch(InstallEvent::StorageProvisioned);

        // Configuring
        let caps = self.engine.capabilities();
        let config = build_configuration(&identity, &layout, &caps, self.desired_memory_gib)?;
        check_guest_minimums(&config, &requirements)?;
        self.engine.validate(&config)?;
        if caps.save_restore_supported {
            self.engine.validate_save_restore(&config)?;
        }
        info!(
            target: "installer",
            cpu_count = config.cpu_count,
            memory_size = config.memory_size,
            "configuration validated"
        );
        self.dispatch(InstallEvent::Configured);

        // Installing
        let mut vm = self.engine.create_machine(config)?;
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        {
            let install = vm.install(&image.path, progress_tx);
            tokio::pin!(install);
            loop {
                tokio::select! {
                    result = &mut install => {
                        result?;
                        break;
                    }
                    Some(fraction) = progress_rx.recv() => {
                        self.dispatch(InstallEvent::InstallProgress(fraction));
                    }
                }
            }
        }
        while let Ok(fraction) = progress_rx.try_recv() {
            self.dispatch(InstallEvent::InstallProgress(fraction));
        }
        self.dispatch(InstallEvent::InstallProgress(1.0));
        self.dispatch(InstallEvent::InstallFinished);

        Ok(())
    }

    /// Local images are checked before the bundle is touched; downloads need
    /// the bundle root to exist first.
    async fn obtain_image(&mut self, source: InstallSource) -> Result<ImageHandle, InstallError> {
        match source {
            InstallSource::Local(path) => {
                self.dispatch(InstallEvent::LocalLoadStarted);
                let image = self.provider.load_local(&path).await?;
                self.prepare_bundle().await?;
                Ok(image)
            }
            InstallSource::Fetch => {
                self.dispatch(InstallEvent::FetchStarted);
                self.prepare_bundle().await?;
                let mut fetch = self.provider.fetch_latest()?;
                let cancel = self.cancel.clone();
                loop {
                    tokio::select! {
                        fraction = fetch.next_progress() => match fraction {
                            Some(fraction) => self.dispatch(InstallEvent::DownloadProgress(fraction)),
                            None => break,
                        },
                        _ = cancel.cancelled() => {
                            info!(target: "installer", "download cancelled");
                            fetch.cancel();
                            return Err(fetch.result().await.err().unwrap_or(NetworkError::Cancelled).into());
                        }
                    }
                }
                Ok(fetch.result().await?)
            }
        }
    }

    /// Create the bundle root, or reuse one a failed attempt left behind.
    async fn prepare_bundle(&self) -> Result<(), StorageError> {
        if !self.store.exists().await {
            return self.store.create_bundle().await;
        }
        if self.store.is_partial_bundle().await? {
            info!(target: "installer", root = %self.store.layout().root().display(), "resuming into partial bundle");
            return Ok(());
        }
        Err(StorageError::AlreadyExists {
            path: self.store.layout().root().to_path_buf(),
        })
    }

    fn dispatch(&mut self, event: InstallEvent) {
        self.machine.handle(&event);
        let next = InstallMachine::ui_state(self.machine.state());
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(target: "installer", state = ?next, "state changed");
            *current = next;
            true
        });
    }
}
