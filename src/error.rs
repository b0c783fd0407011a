//! Error taxonomy shared by every component.
//!
//! Each component returns one of the typed errors below. The installer and
//! the lifecycle manager fold the first unrecovered error into a
//! [`FailureReport`] carried by their `Failed` state.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Coarse category of a failure, used for exit codes and for deciding
/// whether a caller may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Storage,
    Network,
    Validation,
    Engine,
    Image,
}

impl ErrorKind {
    /// Process exit status the binaries use for a failure of this kind.
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Storage => 3,
            ErrorKind::Network => 4,
            ErrorKind::Validation => 5,
            ErrorKind::Configuration => 6,
            ErrorKind::Engine => 7,
            ErrorKind::Image => 8,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Storage => "storage",
            ErrorKind::Network => "network",
            ErrorKind::Validation => "validation",
            ErrorKind::Engine => "engine",
            ErrorKind::Image => "image",
        };
        f.write_str(name)
    }
}

/// Human-readable failure plus the kind it originated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl FailureReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Component errors
// ---------------------------------------------------------------------------

/// The resource a bound applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    CpuCount,
    MemorySize,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::CpuCount => f.write_str("cpu count"),
            Resource::MemorySize => f.write_str("memory size"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("{resource} {actual} is below the guest minimum of {minimum}")]
    BelowGuestMinimum {
        resource: Resource,
        actual: u64,
        minimum: u64,
    },

    #[error("platform bounds for {resource} are inverted (min {min} > max {max})")]
    InvalidBounds { resource: Resource, min: u64, max: u64 },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("'{path}' already exists")]
    AlreadyExists { path: PathBuf },

    #[error("'{path}' not found")]
    NotFound { path: PathBuf },

    #[error("{what} at '{path}' is corrupt")]
    Corrupt { what: &'static str, path: PathBuf },

    #[error("hardware model at '{path}' is not supported on this host")]
    Unsupported { path: PathBuf },

    #[error("bundle at '{path}' already holds an installed machine")]
    AlreadyInstalled { path: PathBuf },

    #[error("cannot {op} '{path}': {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("a restore image download is already in progress")]
    AlreadyInProgress,

    #[error("invalid restore image URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("no restore image available: {0}")]
    Catalog(String),

    #[error("failed to build HTTP client: {0}")]
    BuildClient(#[source] reqwest::Error),

    #[error("HTTP request error: {0}")]
    Request(#[source] reqwest::Error),

    #[error("server returned HTTP {status} for '{url}'")]
    Status { url: String, status: u16 },

    #[error("download interrupted: {0}")]
    Stream(#[source] reqwest::Error),

    #[error("cannot write download to '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("download was cancelled")]
    Cancelled,

    #[error("download task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("restore image offers no configuration supported by this host")]
    NoSupportedConfiguration,

    #[error("the image's hardware model is not supported on this host")]
    Unsupported,
}

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("'{path}' is not a usable restore image: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Hypervisor operation that produced an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOperation {
    LoadImage,
    CreateAuxiliaryStorage,
    Validate,
    ValidateSaveRestore,
    Create,
    Install,
    Start,
    Pause,
    Resume,
    Save,
    Restore,
}

impl fmt::Display for EngineOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineOperation::LoadImage => "load image",
            EngineOperation::CreateAuxiliaryStorage => "create auxiliary storage",
            EngineOperation::Validate => "validate configuration",
            EngineOperation::ValidateSaveRestore => "validate save/restore support",
            EngineOperation::Create => "create machine",
            EngineOperation::Install => "install",
            EngineOperation::Start => "start",
            EngineOperation::Pause => "pause",
            EngineOperation::Resume => "resume",
            EngineOperation::Save => "save state",
            EngineOperation::Restore => "restore state",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("hypervisor failed to {operation}: {message}")]
pub struct EngineError {
    pub operation: EngineOperation,
    pub message: String,
}

impl EngineError {
    pub fn new(operation: EngineOperation, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline errors
// ---------------------------------------------------------------------------

/// Any error the installation pipeline can end with.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("previous installation attempt was interrupted while {stage}")]
    Interrupted { stage: String },
}

impl InstallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InstallError::Configuration(_) => ErrorKind::Configuration,
            InstallError::Storage(_) => ErrorKind::Storage,
            InstallError::Network(_) => ErrorKind::Network,
            InstallError::Validation(_) => ErrorKind::Validation,
            InstallError::Engine(_) => ErrorKind::Engine,
            InstallError::Image(_) => ErrorKind::Image,
            InstallError::Interrupted { .. } => ErrorKind::Storage,
        }
    }

    /// Whether the caller can reasonably try again with different input
    /// (another bundle path, another image file, or after the running
    /// download finishes).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            InstallError::Storage(StorageError::AlreadyExists { .. })
                | InstallError::Storage(StorageError::NotFound { .. })
                | InstallError::Image(ImageError::Invalid { .. })
                | InstallError::Network(NetworkError::AlreadyInProgress)
        )
    }

    pub fn report(&self) -> FailureReport {
        FailureReport::new(self.kind(), self.to_string())
    }
}

/// Any error launching, running or saving the machine can end with.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("cannot {action} while the machine is {state}")]
    InvalidState {
        action: &'static str,
        state: String,
    },

    #[error("lifecycle task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::Configuration(_) => ErrorKind::Configuration,
            LifecycleError::Storage(_) => ErrorKind::Storage,
            LifecycleError::Engine(_) => ErrorKind::Engine,
            LifecycleError::InvalidState { .. } | LifecycleError::Task(_) => ErrorKind::Engine,
        }
    }

    /// Missing, corrupt or unsupported identity cannot be fixed without
    /// reinstalling.
    pub fn is_fatal_for_bundle(&self) -> bool {
        matches!(
            self,
            LifecycleError::Storage(
                StorageError::NotFound { .. }
                    | StorageError::Corrupt { .. }
                    | StorageError::Unsupported { .. }
            )
        )
    }

    pub fn report(&self) -> FailureReport {
        FailureReport::new(self.kind(), self.to_string())
    }
}
