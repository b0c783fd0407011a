//! vmbundle: install, launch, suspend and resume one macOS guest VM.
//!
//! The guest lives in a bundle directory (disk image, firmware storage,
//! identity and optional saved state). [`vm::Installer`] creates and
//! installs it once; [`vm::LifecycleManager`] runs it on every later launch,
//! restoring the saved state when there is one and saving it again on quit.
//! All hypervisor access goes through [`vm::engine::Hypervisor`].

pub mod error;
pub mod logging;
pub mod paths;
pub mod settings;
pub mod state_machine;
pub mod vm;
