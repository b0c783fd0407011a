//! On-disk bundle for one VM instance.
//!
//! ## Layout
//!
//! ```text
//! <root>/AuxiliaryStorage       firmware state, written by the engine
//! <root>/Disk.img               sparse raw disk, sized once at install
//! <root>/HardwareModel          opaque hardware descriptor
//! <root>/MachineIdentifier      opaque machine identity
//! <root>/RestoreImage.ipsw      cached install image (optional)
//! <root>/SaveFile.vzvmsave      saved execution state (optional)
//! ```
//!
//! The identity pair is written exactly once, at install, and is never
//! rewritten: regenerating it would break the installed guest's activation.
//! Nothing here calls into the hypervisor; host compatibility of a stored
//! hardware model is answered through [`HostCompatibility`].

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::vm::engine::HostCompatibility;

const AUXILIARY_STORAGE: &str = "AuxiliaryStorage";
const DISK_IMAGE: &str = "Disk.img";
const HARDWARE_MODEL: &str = "HardwareModel";
const MACHINE_IDENTIFIER: &str = "MachineIdentifier";
const RESTORE_IMAGE: &str = "RestoreImage.ipsw";
const SAVE_FILE: &str = "SaveFile.vzvmsave";

/// Prefix of the staging file a restore image is downloaded into.
pub(crate) const DOWNLOAD_PREFIX: &str = ".RestoreImage";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque hardware capability descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HardwareModel(Vec<u8>);

impl HardwareModel {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Opaque unique identity of one installed guest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MachineIdentifier(Vec<u8>);

impl MachineIdentifier {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmIdentity {
    pub hardware_model: HardwareModel,
    pub machine_identifier: MachineIdentifier,
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Every path inside one bundle, derived from its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    root: PathBuf,
}

impl BundleLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn disk_image_path(&self) -> PathBuf {
        self.root.join(DISK_IMAGE)
    }

    pub fn auxiliary_storage_path(&self) -> PathBuf {
        self.root.join(AUXILIARY_STORAGE)
    }

    pub fn hardware_model_path(&self) -> PathBuf {
        self.root.join(HARDWARE_MODEL)
    }

    pub fn machine_identifier_path(&self) -> PathBuf {
        self.root.join(MACHINE_IDENTIFIER)
    }

    pub fn saved_state_path(&self) -> PathBuf {
        self.root.join(SAVE_FILE)
    }

    pub fn cached_image_path(&self) -> PathBuf {
        self.root.join(RESTORE_IMAGE)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// File management for one bundle.
#[derive(Debug, Clone)]
pub struct BundleStore {
    layout: BundleLayout,
}

impl BundleStore {
    pub fn new(layout: BundleLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(self.layout.root())
            .await
            .unwrap_or(false)
    }

    /// Create the bundle root. Fails with `AlreadyExists` rather than reuse
    /// a directory that may belong to another instance.
    pub async fn create_bundle(&self) -> Result<(), StorageError> {
        let root = self.layout.root();

        if let Some(parent) = root.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io("create parent directory", parent, e))?;
        }

        match tokio::fs::create_dir(root).await {
            Ok(()) => {
                info!(target: "bundle", root = %root.display(), "bundle created");
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => Err(StorageError::AlreadyExists {
                path: root.to_path_buf(),
            }),
            Err(e) => Err(StorageError::io("create bundle directory", root, e)),
        }
    }

    /// True when the root exists, holds no identity, and contains only
    /// files this crate writes during installation. Such a bundle is left
    /// behind by a failed install and may be installed into again.
    pub async fn is_partial_bundle(&self) -> Result<bool, StorageError> {
        let root = self.layout.root();
        let mut dir = match tokio::fs::read_dir(root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(StorageError::io("read bundle directory", root, e)),
        };

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StorageError::io("read bundle directory", root, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let known = matches!(name.as_ref(), AUXILIARY_STORAGE | DISK_IMAGE | RESTORE_IMAGE)
                || name.starts_with(DOWNLOAD_PREFIX);
            if !known {
                debug!(target: "bundle", entry = %name, "foreign entry in bundle");
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Create the raw disk image as a sparse file of exactly `size_bytes`.
    pub async fn provision_disk_image(&self, size_bytes: u64) -> Result<(), StorageError> {
        let path = self.layout.disk_image_path();

        let mut options = tokio::fs::OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        options.mode(0o600);

        let file = options
            .open(&path)
            .await
            .map_err(|e| StorageError::io("create disk image", &path, e))?;
        file.set_len(size_bytes)
            .await
            .map_err(|e| StorageError::io("size disk image", &path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io("sync disk image", &path, e))?;

        info!(target: "bundle", path = %path.display(), size_bytes, "disk image provisioned");
        Ok(())
    }

    pub async fn disk_image_len(&self) -> Result<u64, StorageError> {
        let path = self.layout.disk_image_path();
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| not_found_or_io("stat disk image", &path, e))?;
        Ok(meta.len())
    }

    pub async fn has_identity(&self) -> bool {
        path_exists(&self.layout.hardware_model_path()).await
            || path_exists(&self.layout.machine_identifier_path()).await
    }

    /// Write both identity descriptors. Refuses to replace an existing one.
    /// Either both files end up on disk or neither does.
    pub async fn persist_identity(&self, identity: &VmIdentity) -> Result<(), StorageError> {
        let model_path = self.layout.hardware_model_path();
        write_new(&model_path, identity.hardware_model.as_bytes()).await?;

        if let Err(e) = write_new(
            &self.layout.machine_identifier_path(),
            identity.machine_identifier.as_bytes(),
        )
        .await
        {
            if let Err(cleanup) = tokio::fs::remove_file(&model_path).await {
                warn!(target: "bundle", error = %cleanup, "could not roll back hardware model");
            }
            return Err(e);
        }

        info!(target: "bundle", root = %self.layout.root().display(), "identity persisted");
        Ok(())
    }

    /// Read the identity back, checking the hardware model still runs here.
    pub async fn load_identity(
        &self,
        compat: &impl HostCompatibility,
    ) -> Result<VmIdentity, StorageError> {
        let model_path = self.layout.hardware_model_path();
        let model_bytes = read_descriptor(&model_path, "hardware model").await?;
        let hardware_model = HardwareModel::from_bytes(model_bytes);

        if !compat.supports_hardware_model(&hardware_model) {
            return Err(StorageError::Unsupported { path: model_path });
        }

        let id_path = self.layout.machine_identifier_path();
        let id_bytes = read_descriptor(&id_path, "machine identifier").await?;

        Ok(VmIdentity {
            hardware_model,
            machine_identifier: MachineIdentifier::from_bytes(id_bytes),
        })
    }

    pub async fn has_saved_state(&self) -> bool {
        path_exists(&self.layout.saved_state_path()).await
    }

    /// Remove the saved state file. Absence is not an error.
    pub async fn delete_saved_state(&self) -> Result<(), StorageError> {
        let path = self.layout.saved_state_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(target: "bundle", path = %path.display(), "saved state deleted");
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io("delete saved state", &path, e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn not_found_or_io(op: &'static str, path: &Path, e: std::io::Error) -> StorageError {
    if e.kind() == IoErrorKind::NotFound {
        StorageError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        StorageError::io(op, path, e)
    }
}

async fn read_descriptor(path: &Path, what: &'static str) -> Result<Vec<u8>, StorageError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| not_found_or_io("read descriptor", path, e))?;
    if bytes.is_empty() {
        return Err(StorageError::Corrupt {
            what,
            path: path.to_path_buf(),
        });
    }
    Ok(bytes)
}

async fn write_new(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| {
            if e.kind() == IoErrorKind::AlreadyExists {
                StorageError::AlreadyExists {
                    path: path.to_path_buf(),
                }
            } else {
                StorageError::io("create descriptor", path, e)
            }
        })?;
    file.write_all(data)
        .await
        .map_err(|e| StorageError::io("write descriptor", path, e))?;
    file.sync_all()
        .await
        .map_err(|e| StorageError::io("sync descriptor", path, e))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct AnyModel(bool);

    impl HostCompatibility for AnyModel {
        fn supports_hardware_model(&self, _model: &HardwareModel) -> bool {
            self.0
        }
    }

    fn identity() -> VmIdentity {
        VmIdentity {
            hardware_model: HardwareModel::from_bytes(vec![1, 2, 3]),
            machine_identifier: MachineIdentifier::from_bytes(vec![9, 8, 7, 6]),
        }
    }

    fn store_in(tmp: &tempfile::TempDir) -> BundleStore {
        BundleStore::new(BundleLayout::new(tmp.path().join("VM.bundle")))
    }

    #[test]
    fn layout_uses_fixed_file_names() {
        let layout = BundleLayout::new("/vms/VM.bundle");
        assert_eq!(layout.disk_image_path(), PathBuf::from("/vms/VM.bundle/Disk.img"));
        assert_eq!(
            layout.auxiliary_storage_path(),
            PathBuf::from("/vms/VM.bundle/AuxiliaryStorage")
        );
        assert_eq!(
            layout.hardware_model_path(),
            PathBuf::from("/vms/VM.bundle/HardwareModel")
        );
        assert_eq!(
            layout.machine_identifier_path(),
            PathBuf::from("/vms/VM.bundle/MachineIdentifier")
        );
        assert_eq!(
            layout.cached_image_path(),
            PathBuf::from("/vms/VM.bundle/RestoreImage.ipsw")
        );
        assert_eq!(
            layout.saved_state_path(),
            PathBuf::from("/vms/VM.bundle/SaveFile.vzvmsave")
        );
    }

    #[tokio::test]
    async fn create_bundle_twice_reports_already_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);

        store.create_bundle().await.expect("first create succeeds");
        let err = store.create_bundle().await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn disk_image_has_exact_logical_size() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        store.create_bundle().await.unwrap();

        store.provision_disk_image(64 * 1024 * 1024).await.unwrap();
        assert_eq!(store.disk_image_len().await.unwrap(), 64 * 1024 * 1024);
    }

    #[tokio::test]
    async fn identity_round_trips_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        store.create_bundle().await.unwrap();

        store.persist_identity(&identity()).await.unwrap();
        let loaded = store.load_identity(&AnyModel(true)).await.unwrap();
        assert_eq!(loaded, identity());
    }

    #[tokio::test]
    async fn identity_is_never_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        store.create_bundle().await.unwrap();
        store.persist_identity(&identity()).await.unwrap();

        let other = VmIdentity {
            hardware_model: HardwareModel::from_bytes(vec![42]),
            machine_identifier: MachineIdentifier::from_bytes(vec![42]),
        };
        let err = store.persist_identity(&other).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));

        let loaded = store.load_identity(&AnyModel(true)).await.unwrap();
        assert_eq!(loaded, identity());
    }

    #[tokio::test]
    async fn half_written_identity_is_rolled_back() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        store.create_bundle().await.unwrap();
        // A directory in the way makes the second descriptor write fail.
        std::fs::create_dir(store.layout().machine_identifier_path()).unwrap();

        assert!(store.persist_identity(&identity()).await.is_err());
        assert!(!store.layout().hardware_model_path().exists());
    }

    #[tokio::test]
    async fn missing_identity_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        store.create_bundle().await.unwrap();

        let err = store.load_identity(&AnyModel(true)).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn empty_descriptor_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        store.create_bundle().await.unwrap();
        std::fs::write(store.layout().hardware_model_path(), b"").unwrap();
        std::fs::write(store.layout().machine_identifier_path(), b"id").unwrap();

        let err = store.load_identity(&AnyModel(true)).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { what: "hardware model", .. }));
    }

    #[tokio::test]
    async fn unsupported_hardware_model_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        store.create_bundle().await.unwrap();
        store.persist_identity(&identity()).await.unwrap();

        let err = store.load_identity(&AnyModel(false)).await.unwrap_err();
        assert!(matches!(err, StorageError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn delete_saved_state_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        store.create_bundle().await.unwrap();

        std::fs::write(store.layout().saved_state_path(), b"state").unwrap();
        assert!(store.has_saved_state().await);

        store.delete_saved_state().await.unwrap();
        assert!(!store.has_saved_state().await);
        store.delete_saved_state().await.expect("second delete is a no-op");
    }

    #[tokio::test]
    async fn partial_bundle_detection() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp);
        assert!(!store.is_partial_bundle().await.unwrap());

        store.create_bundle().await.unwrap();
        store.provision_disk_image(4096).await.unwrap();
        assert!(store.is_partial_bundle().await.unwrap());

        std::fs::write(store.layout().root().join("notes.txt"), b"mine").unwrap();
        assert!(!store.is_partial_bundle().await.unwrap());
    }
}
