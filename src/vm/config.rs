//! Resource and device configuration for one launch.
//!
//! Everything here is pure: host capabilities and the persisted identity go
//! in, a [`VmConfiguration`] comes out. Nothing is cached between launches.

use crate::error::{ConfigurationError, Resource};
use crate::vm::bundle::{BundleLayout, VmIdentity};
use crate::vm::engine::{ConfigurationRequirements, HostCapabilities};
use crate::vm::{
    BootLoader, GraphicsDevice, KeyboardDevice, MacAddress, NetworkDevice, PointingDevice,
    StorageDevice, VmConfiguration,
};

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Logical size of the disk image created at install.
pub const DISK_IMAGE_SIZE: u64 = 200 * GIB;

/// Default desired guest memory in GiB.
pub const DEFAULT_MEMORY_GIB: f64 = 6.0;

/// One CPU is left to the host. Never below one, always within bounds.
pub fn compute_cpu_count(host_logical_cpus: u32, platform_min: u32, platform_max: u32) -> u32 {
    let requested = host_logical_cpus.saturating_sub(1).max(1);
    requested.min(platform_max).max(platform_min.max(1))
}

/// Desired GiB to bytes, clamped to `[platform_min, platform_max]`.
pub fn compute_memory_size(desired_gib: f64, platform_min: u64, platform_max: u64) -> u64 {
    if desired_gib.is_nan() || desired_gib <= 0.0 {
        return platform_min;
    }
    // Saturating float-to-int cast; anything huge (including +inf) lands on
    // u64::MAX and is clamped below.
    let requested = (desired_gib * GIB as f64) as u64;
    requested.min(platform_max).max(platform_min)
}

fn check_bounds(resource: Resource, min: u64, max: u64) -> Result<(), ConfigurationError> {
    if min > max {
        return Err(ConfigurationError::InvalidBounds { resource, min, max });
    }
    Ok(())
}

/// Assemble the full configuration for `identity` stored under `layout`.
pub fn build_configuration(
    identity: &VmIdentity,
    layout: &BundleLayout,
    host: &HostCapabilities,
    desired_memory_gib: f64,
) -> Result<VmConfiguration, ConfigurationError> {
    check_bounds(
        Resource::CpuCount,
        host.min_cpu_count as u64,
        host.max_cpu_count as u64,
    )?;
    check_bounds(
        Resource::MemorySize,
        host.min_memory_size,
        host.max_memory_size,
    )?;

    let cpu_count = compute_cpu_count(
        host.logical_cpu_count,
        host.min_cpu_count,
        host.max_cpu_count,
    );
    let memory_size = compute_memory_size(
        desired_memory_gib,
        host.min_memory_size,
        host.max_memory_size,
    );

    let keyboard = if host.mac_keyboard_supported {
        KeyboardDevice::Mac
    } else {
        KeyboardDevice::Usb
    };

    Ok(VmConfiguration {
        cpu_count,
        memory_size,
        boot_loader: BootLoader::MacOs,
        storage: vec![StorageDevice {
            disk_image_path: layout.disk_image_path(),
            read_only: false,
        }],
        network: vec![NetworkDevice::Nat {
            mac_address: MacAddress::random_locally_administered(),
        }],
        pointing: PointingDevice::Trackpad,
        keyboard,
        graphics: GraphicsDevice::default(),
        auxiliary_storage_path: layout.auxiliary_storage_path(),
        identity: identity.clone(),
    })
}

/// Reject a configuration the selected image cannot boot with.
pub fn check_guest_minimums(
    config: &VmConfiguration,
    requirements: &ConfigurationRequirements,
) -> Result<(), ConfigurationError> {
    if config.cpu_count < requirements.minimum_cpu_count {
        return Err(ConfigurationError::BelowGuestMinimum {
            resource: Resource::CpuCount,
            actual: config.cpu_count as u64,
            minimum: requirements.minimum_cpu_count as u64,
        });
    }
    if config.memory_size < requirements.minimum_memory_size {
        return Err(ConfigurationError::BelowGuestMinimum {
            resource: Resource::MemorySize,
            actual: config.memory_size,
            minimum: requirements.minimum_memory_size,
        });
    }
    Ok(())
}
