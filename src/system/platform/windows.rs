use std::ffi::{OsString, c_void};
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;

use windows_sys::Wdk::System::SystemInformation::NtQuerySystemInformation;
use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_SHARE_READ, FILE_SHARE_WRITE, GetDiskFreeSpaceExW, GetDriveTypeW,
    GetLogicalDrives, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::DeviceIoControl;
use windows_sys::Win32::System::Ioctl::{DISK_PERFORMANCE, IOCTL_DISK_PERFORMANCE};
use windows_sys::Win32::System::Services::{
    CloseServiceHandle, ENUM_SERVICE_STATUS_PROCESSW, EnumServicesStatusExW, OpenSCManagerW,
    SC_ENUM_PROCESS_INFO, SC_MANAGER_ENUMERATE_SERVICE, SERVICE_ACTIVE, SERVICE_WIN32,
};
use windows_sys::Win32::System::SystemInformation::{GlobalMemoryStatusEx, MEMORYSTATUSEX};
use windows_sys::Win32::System::Threading::{
    OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, QueryFullProcessImageNameW,
};

use crate::error::SourceError;
use crate::system::buffer::{ListingSource, QueryOutcome};
use crate::system::metrics::{DiskBusySample, DriveInfo, MachineProbe, MemoryStatus};
use crate::system::services::{ServiceMembership, ServiceSource};

use super::PlatformExtensions;

pub struct Platform;

impl PlatformExtensions for Platform {
    fn listing_source() -> Box<dyn ListingSource> {
        Box::new(NtListing)
    }

    fn service_source() -> Box<dyn ServiceSource> {
        Box::new(ScmServices)
    }

    fn machine_probe() -> Box<dyn MachineProbe> {
        Box::new(Win32Probe)
    }
}

const SYSTEM_PROCESS_INFORMATION_CLASS: i32 = 5;
const STATUS_INFO_LENGTH_MISMATCH: i32 = 0xC000_0004_u32 as i32;
const STATUS_BUFFER_TOO_SMALL: i32 = 0xC000_0023_u32 as i32;
const ERROR_MORE_DATA: u32 = 234;
const DRIVE_FIXED: u32 = 3;
const MAX_PHYSICAL_DRIVES: u32 = 32;
const MAX_SERVICE_PAGES: u32 = 8;

fn wide(s: &str) -> Vec<u16> {
    std::ffi::OsStr::new(s)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn last_error(api: &'static str) -> SourceError {
    // SAFETY: reads thread-local state only.
    let code = unsafe { GetLastError() };
    SourceError::Os {
        api,
        code: code as i32,
    }
}

/// Closes the wrapped handle on drop.
struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle was returned open by the OS and is closed once.
        unsafe { CloseHandle(self.0) };
    }
}

fn image_path(pid: u32) -> Option<PathBuf> {
    // SAFETY: OpenProcess has no memory preconditions; a null return is
    // checked before use.
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
    if handle.is_null() {
        return None;
    }
    let handle = OwnedHandle(handle);
    let mut buf = vec![0u16; 1024];
    let mut len = buf.len() as u32;
    // SAFETY: `buf` holds `len` UTF-16 units and outlives the call.
    let ok = unsafe { QueryFullProcessImageNameW(handle.0, 0, buf.as_mut_ptr(), &mut len) };
    if ok == 0 {
        return None;
    }
    buf.truncate(len as usize);
    Some(PathBuf::from(OsString::from_wide(&buf)))
}

/// The kernel process listing, read directly into the caller's buffer.
struct NtListing;

impl ListingSource for NtListing {
    fn query(&mut self, buf: &mut [u8]) -> Result<QueryOutcome, SourceError> {
        let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let mut returned = 0u32;
        // SAFETY: `buf` is valid for writes of `len` bytes and 8-aligned by
        // SnapshotBuffer; `returned` is a live local.
        let status = unsafe {
            NtQuerySystemInformation(
                SYSTEM_PROCESS_INFORMATION_CLASS,
                buf.as_mut_ptr().cast::<c_void>(),
                len,
                &mut returned,
            )
        };
        match status {
            STATUS_INFO_LENGTH_MISMATCH | STATUS_BUFFER_TOO_SMALL => Ok(QueryOutcome::TooSmall {
                required: returned as usize,
            }),
            s if s < 0 => Err(SourceError::Os {
                api: "NtQuerySystemInformation",
                code: s,
            }),
            _ => Ok(QueryOutcome::Complete((returned as usize).min(buf.len()))),
        }
    }

    fn executable_path(&self, pid: u32) -> Option<PathBuf> {
        image_path(pid)
    }
}

/// Active Win32 services known to the service control manager.
struct ScmServices;

impl ServiceSource for ScmServices {
    fn enumerate(&mut self) -> Result<ServiceMembership, SourceError> {
        // SAFETY: null machine and database names select the local SCM.
        let scm = unsafe { OpenSCManagerW(ptr::null(), ptr::null(), SC_MANAGER_ENUMERATE_SERVICE) };
        if scm.is_null() {
            return Err(last_error("OpenSCManagerW"));
        }

        let mut pids = Vec::new();
        let mut storage: Vec<u64> = Vec::new();
        let mut resume = 0u32;
        let mut result = Ok(());
        for _ in 0..MAX_SERVICE_PAGES {
            let mut needed = 0u32;
            let mut returned = 0u32;
            // SAFETY: `storage` is 8-aligned and valid for the byte length
            // passed; the out-params are live locals.
            let ok = unsafe {
                EnumServicesStatusExW(
                    scm,
                    SC_ENUM_PROCESS_INFO,
                    SERVICE_WIN32,
                    SERVICE_ACTIVE,
                    storage.as_mut_ptr().cast::<u8>(),
                    (storage.len() * 8) as u32,
                    &mut needed,
                    &mut returned,
                    &mut resume,
                    ptr::null(),
                )
            };
            // SAFETY: reads thread-local state only.
            let more = ok == 0 && unsafe { GetLastError() } == ERROR_MORE_DATA;
            if ok == 0 && !more {
                result = Err(last_error("EnumServicesStatusExW"));
                break;
            }
            if returned > 0 {
                // SAFETY: the SCM wrote `returned` entries at the start of
                // `storage`; the string pointers they hold are not read.
                let entries = unsafe {
                    std::slice::from_raw_parts(
                        storage.as_ptr().cast::<ENUM_SERVICE_STATUS_PROCESSW>(),
                        returned as usize,
                    )
                };
                pids.extend(entries.iter().map(|e| e.ServiceStatusProcess.dwProcessId));
            }
            if !more {
                break;
            }
            let words = (needed as usize).div_ceil(8);
            if words > storage.len() {
                storage.resize(words, 0);
            }
        }
        // SAFETY: `scm` was opened above and is closed once.
        unsafe { CloseServiceHandle(scm) };
        result?;

        let mut membership = ServiceMembership::new();
        for pid in pids {
            membership.insert_pid(pid);
            if let Some(name) = image_path(pid)
                .as_deref()
                .and_then(Path::file_name)
                .and_then(|n| n.to_str())
            {
                membership.insert_name(name);
            }
        }
        Ok(membership)
    }
}

struct Win32Probe;

impl MachineProbe for Win32Probe {
    fn memory(&mut self) -> Result<MemoryStatus, SourceError> {
        // SAFETY: MEMORYSTATUSEX is plain data; zeroed is a valid value.
        let mut status: MEMORYSTATUSEX = unsafe { std::mem::zeroed() };
        status.dwLength = std::mem::size_of::<MEMORYSTATUSEX>() as u32;
        // SAFETY: `status` is a live, correctly sized out-param.
        if unsafe { GlobalMemoryStatusEx(&mut status) } == 0 {
            return Err(last_error("GlobalMemoryStatusEx"));
        }
        Ok(MemoryStatus {
            total_physical: status.ullTotalPhys,
            available_physical: status.ullAvailPhys,
            commit_limit: status.ullTotalPageFile,
            commit_available: status.ullAvailPageFile,
        })
    }

    fn fixed_drives(&mut self) -> Result<Vec<DriveInfo>, SourceError> {
        // SAFETY: no arguments.
        let mask = unsafe { GetLogicalDrives() };
        if mask == 0 {
            return Err(last_error("GetLogicalDrives"));
        }
        let mut drives = Vec::new();
        for index in 0..26u8 {
            if mask & (1 << index) == 0 {
                continue;
            }
            let label = format!("{}:", (b'A' + index) as char);
            let root = wide(&format!("{label}\\"));
            // SAFETY: `root` is NUL-terminated.
            if unsafe { GetDriveTypeW(root.as_ptr()) } != DRIVE_FIXED {
                continue;
            }
            let mut caller_free = 0u64;
            let mut total = 0u64;
            let mut total_free = 0u64;
            // SAFETY: `root` is NUL-terminated; out-params are live locals.
            let ok = unsafe {
                GetDiskFreeSpaceExW(root.as_ptr(), &mut caller_free, &mut total, &mut total_free)
            };
            if ok == 0 {
                tracing::debug!(drive = %label, "free space query failed");
                continue;
            }
            drives.push(DriveInfo {
                label,
                total_bytes: total,
                free_bytes: total_free,
            });
        }
        Ok(drives)
    }

    /// Busy time is `QueryTime - IdleTime`; only its change between two
    /// samples is meaningful.
    fn disk_busy(&mut self) -> Result<DiskBusySample, SourceError> {
        let mut sample = DiskBusySample::default();
        for index in 0..MAX_PHYSICAL_DRIVES {
            let path = wide(&format!("\\\\.\\PhysicalDrive{index}"));
            // SAFETY: `path` is NUL-terminated; zero access rights only
            // permit metadata ioctls.
            let handle = unsafe {
                CreateFileW(
                    path.as_ptr(),
                    0,
                    FILE_SHARE_READ | FILE_SHARE_WRITE,
                    ptr::null(),
                    OPEN_EXISTING,
                    0,
                    ptr::null_mut(),
                )
            };
            if handle == INVALID_HANDLE_VALUE {
                continue;
            }
            let handle = OwnedHandle(handle);
            // SAFETY: DISK_PERFORMANCE is plain data; zeroed is a valid value.
            let mut perf: DISK_PERFORMANCE = unsafe { std::mem::zeroed() };
            let mut returned = 0u32;
            // SAFETY: `perf` is a live out-buffer of the size passed.
            let ok = unsafe {
                DeviceIoControl(
                    handle.0,
                    IOCTL_DISK_PERFORMANCE,
                    ptr::null(),
                    0,
                    (&mut perf as *mut DISK_PERFORMANCE).cast::<c_void>(),
                    std::mem::size_of::<DISK_PERFORMANCE>() as u32,
                    &mut returned,
                    ptr::null_mut(),
                )
            };
            if ok == 0 {
                continue;
            }
            let busy_100ns = perf.QueryTime.saturating_sub(perf.IdleTime).max(0) as u64;
            sample.busy_ms = sample.busy_ms.saturating_add(busy_100ns / 10_000);
            sample.devices += 1;
        }
        if sample.devices == 0 {
            return Err(SourceError::Unsupported("no physical drive answered IOCTL_DISK_PERFORMANCE"));
        }
        Ok(sample)
    }
}
