//! VM management for one macOS guest bundle.
//!
//! Provides the on-disk bundle and identity model, configuration
//! computation, restore image acquisition, the first-time installer and the
//! launch/suspend lifecycle, all against the [`engine::Hypervisor`] contract.

use std::fmt;
use std::path::PathBuf;

pub mod bundle;
pub mod config;
pub mod engine;
pub mod installer;
pub mod lifecycle;
pub mod restore_image;

use bundle::VmIdentity;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Full resource and device configuration handed to the engine.
///
/// Built fresh by [`config::build_configuration`] for every install and
/// launch; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfiguration {
    /// Number of virtual CPUs.
    pub cpu_count: u32,

    /// Guest memory in bytes.
    pub memory_size: u64,

    pub boot_loader: BootLoader,

    /// Block devices; the first one is the boot disk.
    pub storage: Vec<StorageDevice>,

    pub network: Vec<NetworkDevice>,

    pub pointing: PointingDevice,

    pub keyboard: KeyboardDevice,

    pub graphics: GraphicsDevice,

    /// Firmware storage created at install (see [`bundle::BundleLayout`]).
    pub auxiliary_storage_path: PathBuf,

    pub identity: VmIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootLoader {
    MacOs,
}

/// Virtio block device backed by a raw disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDevice {
    pub disk_image_path: PathBuf,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkDevice {
    /// Virtio network device behind host NAT.
    Nat { mac_address: MacAddress },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointingDevice {
    Trackpad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyboardDevice {
    Mac,
    Usb,
}

/// A single Mac graphics display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsDevice {
    pub width_pixels: u32,
    pub height_pixels: u32,
    pub pixels_per_inch: u32,
}

impl Default for GraphicsDevice {
    fn default() -> Self {
        Self {
            width_pixels: 1920,
            height_pixels: 1200,
            pixels_per_inch: 80,
        }
    }
}

/// 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Random unicast address with the locally administered bit set.
    pub fn random_locally_administered() -> Self {
        let mut octets: [u8; 6] = rand::random();
        octets[0] = (octets[0] | 0x02) & 0xfe;
        Self(octets)
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use bundle::{BundleLayout, BundleStore};
pub use engine::{HostCapabilities, Hypervisor, VirtualMachine};
pub use installer::{InstallSource, Installer};
pub use lifecycle::{LifecycleManager, TerminationDecision, TerminationHandle};
pub use restore_image::RestoreImageProvider;
