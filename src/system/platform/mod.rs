use crate::error::SourceError;

use super::buffer::ListingSource;
use super::metrics::{DriveInfo, MachineProbe};
use super::services::ServiceSource;

pub trait PlatformExtensions {
    fn listing_source() -> Box<dyn ListingSource>;
    fn service_source() -> Box<dyn ServiceSource>;
    fn machine_probe() -> Box<dyn MachineProbe>;
}

#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(any(
    target_os = "linux",
    all(target_os = "windows", target_pointer_width = "64")
)))]
mod portable;
#[cfg(all(target_os = "windows", target_pointer_width = "64"))]
mod windows;

#[cfg(target_os = "linux")]
use linux as platform_impl;
#[cfg(not(any(
    target_os = "linux",
    all(target_os = "windows", target_pointer_width = "64")
)))]
use portable as platform_impl;
#[cfg(all(target_os = "windows", target_pointer_width = "64"))]
use windows as platform_impl;

pub fn listing_source() -> Box<dyn ListingSource> {
    platform_impl::Platform::listing_source()
}

pub fn service_source() -> Box<dyn ServiceSource> {
    platform_impl::Platform::service_source()
}

pub fn machine_probe() -> Box<dyn MachineProbe> {
    platform_impl::Platform::machine_probe()
}

/// File systems that live on another machine; never reported as fixed drives.
#[cfg_attr(all(target_os = "windows", target_pointer_width = "64"), allow(dead_code))]
const NETWORK_FILE_SYSTEMS: [&str; 8] = [
    "nfs", "nfs4", "cifs", "smb", "smbfs", "smb3", "afpfs", "fuse.sshfs",
];

/// Non-removable local disks as seen by `sysinfo`.
#[cfg_attr(all(target_os = "windows", target_pointer_width = "64"), allow(dead_code))]
fn sysinfo_fixed_drives() -> Result<Vec<DriveInfo>, SourceError> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mut drives: Vec<DriveInfo> = Vec::new();
    for disk in disks.list() {
        let fs = disk.file_system().to_string_lossy().to_ascii_lowercase();
        if disk.is_removable() || NETWORK_FILE_SYSTEMS.contains(&fs.as_str()) {
            continue;
        }
        let label = disk.mount_point().to_string_lossy().to_string();
        if drives.iter().any(|d| d.label == label) {
            continue;
        }
        drives.push(DriveInfo {
            label,
            total_bytes: disk.total_space(),
            free_bytes: disk.available_space(),
        });
    }
    Ok(drives)
}
