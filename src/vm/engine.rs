//! Contract with the hypervisor engine.
//!
//! The engine is the component that actually executes guest code
//! (Virtualization.framework on Apple Silicon). This crate never talks to it
//! directly; everything goes through [`Hypervisor`] and [`VirtualMachine`] so
//! the orchestration can be driven by any backend, including the scripted
//! engine the integration tests use.
//!
//! ## Architecture
//!
//! ```text
//! Hypervisor (one per process)
//!     ├─► capabilities()            host cpu/memory bounds, feature flags
//!     ├─► load_restore_image()      image → most capable configuration
//!     ├─► validate() / create_machine(VmConfiguration)
//!     └─► VirtualMachine
//!             ├─► install / start / pause / resume
//!             ├─► save_state / restore_state
//!             └─► guest_stops()     stopped normally / stopped with error
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{EngineError, EngineOperation, NetworkError};
use crate::vm::VmConfiguration;
use crate::vm::bundle::{HardwareModel, MachineIdentifier};

// ---------------------------------------------------------------------------
// Shared types
// ---------------------------------------------------------------------------

/// What the host and the engine allow, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Logical CPUs on the host.
    pub logical_cpu_count: u32,
    pub min_cpu_count: u32,
    pub max_cpu_count: u32,
    /// Memory bounds in bytes.
    pub min_memory_size: u64,
    pub max_memory_size: u64,
    /// Whether the engine can save and restore machine state. Older hosts
    /// cannot, in which case launches always cold start and termination
    /// never defers.
    pub save_restore_supported: bool,
    /// Mac keyboard device available (USB keyboard otherwise).
    pub mac_keyboard_supported: bool,
}

/// The most capable configuration a restore image supports on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationRequirements {
    pub hardware_model: HardwareModel,
    pub minimum_cpu_count: u32,
    /// Bytes.
    pub minimum_memory_size: u64,
}

/// A restore image the engine has parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreImage {
    pub path: PathBuf,
    /// `None` when the image has nothing this host can run.
    pub most_featureful_configuration: Option<ConfigurationRequirements>,
}

/// Why a running guest stopped on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestStop {
    /// The guest shut itself down.
    Normal,
    /// The engine stopped the guest after an error.
    Error(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Host compatibility queries needed when reading a persisted identity.
pub trait HostCompatibility {
    fn supports_hardware_model(&self, model: &HardwareModel) -> bool;
}

/// Process-wide entry point into the engine.
#[async_trait]
pub trait Hypervisor: HostCompatibility + Send + Sync + 'static {
    type Machine: VirtualMachine;

    fn capabilities(&self) -> HostCapabilities;

    /// URL of the latest restore image this host supports.
    async fn latest_restore_image_url(&self) -> Result<String, NetworkError>;

    async fn load_restore_image(&self, path: &Path) -> Result<RestoreImage, EngineError>;

    /// Mint a brand-new machine identifier. Only the installer calls this.
    fn new_machine_identifier(&self) -> MachineIdentifier;

    /// Create the firmware storage for `model` at `path`.
    async fn create_auxiliary_storage(
        &self,
        path: &Path,
        model: &HardwareModel,
    ) -> Result<(), EngineError>;

    fn validate(&self, config: &VmConfiguration) -> Result<(), EngineError>;

    fn validate_save_restore(&self, config: &VmConfiguration) -> Result<(), EngineError>;

    fn create_machine(&self, config: VmConfiguration) -> Result<Self::Machine, EngineError>;
}

/// One engine-backed machine instance.
///
/// Callers never issue two operations at once against the same instance.
#[async_trait]
pub trait VirtualMachine: Send + 'static {
    /// Install the guest OS from `image`, sending fractions in `[0, 1]` on
    /// `progress` as the installation advances.
    async fn install(
        &mut self,
        image: &Path,
        progress: mpsc::UnboundedSender<f64>,
    ) -> Result<(), EngineError>;

    async fn start(&mut self) -> Result<(), EngineError>;

    async fn pause(&mut self) -> Result<(), EngineError>;

    async fn resume(&mut self) -> Result<(), EngineError>;

    async fn save_state(&mut self, path: &Path) -> Result<(), EngineError>;

    async fn restore_state(&mut self, path: &Path) -> Result<(), EngineError>;

    /// Take the guest-stop notification channel. Returns `None` after the
    /// first call.
    fn guest_stops(&mut self) -> Option<mpsc::UnboundedReceiver<GuestStop>>;
}

// ---------------------------------------------------------------------------
// Placeholder backend
// ---------------------------------------------------------------------------

/// Backend used when no engine binding is linked into the build.
///
/// Reports real host CPU counts so configuration can still be computed, and
/// fails every engine operation with an explanatory error.
#[derive(Debug, Clone, Default)]
pub struct UnavailableEngine;

/// Uninhabited: [`UnavailableEngine`] never creates a machine.
#[derive(Debug)]
pub enum UnavailableMachine {}

const UNAVAILABLE: &str =
    "no hypervisor backend is linked into this build (Virtualization.framework required)";

impl HostCompatibility for UnavailableEngine {
    fn supports_hardware_model(&self, _model: &HardwareModel) -> bool {
        false
    }
}

#[async_trait]
impl Hypervisor for UnavailableEngine {
    type Machine = UnavailableMachine;

    fn capabilities(&self) -> HostCapabilities {
        let logical_cpu_count = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        HostCapabilities {
            logical_cpu_count,
            min_cpu_count: 1,
            max_cpu_count: logical_cpu_count,
            min_memory_size: 2 * crate::vm::config::GIB,
            max_memory_size: 64 * crate::vm::config::GIB,
            save_restore_supported: false,
            mac_keyboard_supported: false,
        }
    }

    async fn latest_restore_image_url(&self) -> Result<String, NetworkError> {
        Err(NetworkError::Catalog(format!(
            "{UNAVAILABLE}; set image_url in settings to download directly"
        )))
    }

    async fn load_restore_image(&self, _path: &Path) -> Result<RestoreImage, EngineError> {
        Err(EngineError::new(EngineOperation::LoadImage, UNAVAILABLE))
    }

    fn new_machine_identifier(&self) -> MachineIdentifier {
        MachineIdentifier::from_bytes(rand::random::<[u8; 16]>().to_vec())
    }

    async fn create_auxiliary_storage(
        &self,
        _path: &Path,
        _model: &HardwareModel,
    ) -> Result<(), EngineError> {
        Err(EngineError::new(
            EngineOperation::CreateAuxiliaryStorage,
            UNAVAILABLE,
        ))
    }

    fn validate(&self, _config: &VmConfiguration) -> Result<(), EngineError> {
        Err(EngineError::new(EngineOperation::Validate, UNAVAILABLE))
    }

    fn validate_save_restore(&self, _config: &VmConfiguration) -> Result<(), EngineError> {
        Err(EngineError::new(
            EngineOperation::ValidateSaveRestore,
            UNAVAILABLE,
        ))
    }

    fn create_machine(&self, _config: VmConfiguration) -> Result<Self::Machine, EngineError> {
        Err(EngineError::new(EngineOperation::Create, UNAVAILABLE))
    }
}

#[async_trait]
impl VirtualMachine for UnavailableMachine {
    async fn install(
        &mut self,
        _image: &Path,
        _progress: mpsc::UnboundedSender<f64>,
    ) -> Result<(), EngineError> {
        match *self {}
    }

    async fn start(&mut self) -> Result<(), EngineError> {
        match *self {}
    }

    async fn pause(&mut self) -> Result<(), EngineError> {
        match *self {}
    }

    async fn resume(&mut self) -> Result<(), EngineError> {
        match *self {}
    }

    async fn save_state(&mut self, _path: &Path) -> Result<(), EngineError> {
        match *self {}
    }

    async fn restore_state(&mut self, _path: &Path) -> Result<(), EngineError> {
        match *self {}
    }

    fn guest_stops(&mut self) -> Option<mpsc::UnboundedReceiver<GuestStop>> {
        match *self {}
    }
}
