//! Scripted in-memory hypervisor shared by the integration tests.
//!
//! `ScriptedEngine` implements the engine traits without running anything.
//! Tests decide which operations fail, what the restore image reports, and
//! when the guest stops; every call is recorded so ordering can be asserted.
//! Saved state is a real file, so the bundle store sees it like it would a
//! real engine's.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use vmbundle::error::{EngineError, EngineOperation, NetworkError};
use vmbundle::settings::Settings;
use vmbundle::vm::VmConfiguration;
use vmbundle::vm::bundle::{HardwareModel, MachineIdentifier};
use vmbundle::vm::config::GIB;
use vmbundle::vm::engine::{
    ConfigurationRequirements, GuestStop, HostCapabilities, HostCompatibility, Hypervisor,
    RestoreImage, VirtualMachine,
};

pub const SAVED_STATE_BYTES: &[u8] = b"scripted saved state";

pub fn hardware_model() -> HardwareModel {
    HardwareModel::from_bytes(b"scripted-hardware-model".to_vec())
}

/// What the engine does; mutable from the test while it runs.
#[derive(Debug)]
pub struct Script {
    pub capabilities: HostCapabilities,
    pub catalog_url: Option<String>,
    /// `None` makes the image report no supported configuration.
    pub requirements: Option<ConfigurationRequirements>,
    pub model_supported: bool,
    pub failing: HashSet<EngineOperation>,
    pub install_progress: Vec<f64>,
    /// How long `start` takes.
    pub start_delay: Option<Duration>,
    pub calls: Vec<String>,
    pub machines_created: usize,
    pub identifiers_minted: usize,
    pub guest_stop_tx: Option<mpsc::UnboundedSender<GuestStop>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            capabilities: HostCapabilities {
                logical_cpu_count: 8,
                min_cpu_count: 1,
                max_cpu_count: 16,
                min_memory_size: GIB,
                max_memory_size: 64 * GIB,
                save_restore_supported: true,
                mac_keyboard_supported: true,
            },
            catalog_url: None,
            requirements: Some(ConfigurationRequirements {
                hardware_model: hardware_model(),
                minimum_cpu_count: 2,
                minimum_memory_size: 4 * GIB,
            }),
            model_supported: true,
            failing: HashSet::new(),
            install_progress: vec![0.1, 0.4, 0.3, 0.9],
            start_delay: None,
            calls: Vec::new(),
            machines_created: 0,
            identifiers_minted: 0,
            guest_stop_tx: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_save_restore() -> Self {
        let engine = Self::new();
        engine.script().capabilities.save_restore_supported = false;
        engine
    }

    pub fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn fail(&self, op: EngineOperation) {
        self.script().failing.insert(op);
    }

    pub fn heal(&self, op: EngineOperation) {
        self.script().failing.remove(&op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.script().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.script().calls.clear();
    }

    /// Simulate the guest stopping on its own.
    pub fn stop_guest(&self, stop: GuestStop) {
        if let Some(tx) = &self.script().guest_stop_tx {
            let _ = tx.send(stop);
        }
    }

    fn record(&self, op: EngineOperation, call: &str) -> Result<(), EngineError> {
        let mut script = self.script();
        script.calls.push(call.to_string());
        if script.failing.contains(&op) {
            return Err(EngineError::new(op, format!("scripted {call} failure")));
        }
        Ok(())
    }
}

impl HostCompatibility for ScriptedEngine {
    fn supports_hardware_model(&self, _model: &HardwareModel) -> bool {
        self.script().model_supported
    }
}

#[async_trait]
impl Hypervisor for ScriptedEngine {
    type Machine = ScriptedMachine;

    fn capabilities(&self) -> HostCapabilities {
        self.script().capabilities.clone()
    }

    async fn latest_restore_image_url(&self) -> Result<String, NetworkError> {
        self.script()
            .catalog_url
            .clone()
            .ok_or_else(|| NetworkError::Catalog("scripted catalog is empty".into()))
    }

    async fn load_restore_image(&self, path: &Path) -> Result<RestoreImage, EngineError> {
        self.record(EngineOperation::LoadImage, "load_restore_image")?;
        Ok(RestoreImage {
            path: path.to_path_buf(),
            most_featureful_configuration: self.script().requirements.clone(),
        })
    }

    fn new_machine_identifier(&self) -> MachineIdentifier {
        let mut script = self.script();
        script.identifiers_minted += 1;
        let n = script.identifiers_minted as u8;
        MachineIdentifier::from_bytes(vec![0xEC, n, n, n])
    }

    async fn create_auxiliary_storage(
        &self,
        path: &Path,
        _model: &HardwareModel,
    ) -> Result<(), EngineError> {
        self.record(EngineOperation::CreateAuxiliaryStorage, "create_auxiliary_storage")?;
        std::fs::write(path, b"aux")
            .map_err(|e| EngineError::new(EngineOperation::CreateAuxiliaryStorage, e.to_string()))
    }

    fn validate(&self, _config: &VmConfiguration) -> Result<(), EngineError> {
        self.record(EngineOperation::Validate, "validate")
    }

    fn validate_save_restore(&self, _config: &VmConfiguration) -> Result<(), EngineError> {
        self.record(EngineOperation::ValidateSaveRestore, "validate_save_restore")
    }

    fn create_machine(&self, config: VmConfiguration) -> Result<ScriptedMachine, EngineError> {
        self.record(EngineOperation::Create, "create_machine")?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut script = self.script();
        script.machines_created += 1;
        script.guest_stop_tx = Some(tx);
        Ok(ScriptedMachine {
            engine: self.clone(),
            config,
            stops: Some(rx),
        })
    }
}

#[derive(Debug)]
pub struct ScriptedMachine {
    engine: ScriptedEngine,
    pub config: VmConfiguration,
    stops: Option<mpsc::UnboundedReceiver<GuestStop>>,
}

#[async_trait]
impl VirtualMachine for ScriptedMachine {
    async fn install(
        &mut self,
        _image: &Path,
        progress: mpsc::UnboundedSender<f64>,
    ) -> Result<(), EngineError> {
        let steps = self.engine.script().install_progress.clone();
        for fraction in steps {
            let _ = progress.send(fraction);
            tokio::task::yield_now().await;
        }
        self.engine.record(EngineOperation::Install, "install")
    }

    async fn start(&mut self) -> Result<(), EngineError> {
        let delay = self.engine.script().start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.engine.record(EngineOperation::Start, "start")
    }

    async fn pause(&mut self) -> Result<(), EngineError> {
        self.engine.record(EngineOperation::Pause, "pause")
    }

    async fn resume(&mut self) -> Result<(), EngineError> {
        self.engine.record(EngineOperation::Resume, "resume")
    }

    async fn save_state(&mut self, path: &Path) -> Result<(), EngineError> {
        self.engine.record(EngineOperation::Save, "save_state")?;
        tokio::fs::write(path, SAVED_STATE_BYTES)
            .await
            .map_err(|e| EngineError::new(EngineOperation::Save, e.to_string()))
    }

    async fn restore_state(&mut self, path: &Path) -> Result<(), EngineError> {
        self.engine.record(EngineOperation::Restore, "restore_state")?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::new(EngineOperation::Restore, e.to_string()))?;
        if bytes != SAVED_STATE_BYTES {
            return Err(EngineError::new(EngineOperation::Restore, "unrecognised save file"));
        }
        Ok(())
    }

    fn guest_stops(&mut self) -> Option<mpsc::UnboundedReceiver<GuestStop>> {
        self.stops.take()
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Settings pointing at `<tmp>/VM.bundle`.
pub fn settings_in(tmp: &Path) -> Settings {
    Settings {
        bundle_path: tmp.join("VM.bundle"),
        memory_gib: 6.0,
        image_url: None,
    }
}

/// A stand-in restore image file outside the bundle.
pub fn local_image(tmp: &Path) -> PathBuf {
    let path = tmp.join("UniversalMac_Restore.ipsw");
    std::fs::write(&path, b"not really an ipsw").unwrap();
    path
}

/// Names of every entry directly inside `dir`, sorted.
pub fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(rd) => rd
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}
