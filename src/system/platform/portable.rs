use std::path::PathBuf;

use sysinfo::{MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

use crate::error::SourceError;
use crate::system::buffer::{ListingSource, QueryOutcome};
use crate::system::layout::{ListingEntry, ListingWriter};
use crate::system::metrics::{DiskBusySample, DriveInfo, MachineProbe, MemoryStatus};
use crate::system::services::{ServiceMembership, ServiceSource};

use super::{PlatformExtensions, sysinfo_fixed_drives};

pub struct Platform;

impl PlatformExtensions for Platform {
    fn listing_source() -> Box<dyn ListingSource> {
        Box::new(SysinfoListing::new())
    }

    fn service_source() -> Box<dyn ServiceSource> {
        Box::new(NoServices)
    }

    fn machine_probe() -> Box<dyn MachineProbe> {
        Box::new(SysinfoProbe::new())
    }
}

const UNITS_PER_MS: u64 = 10_000;
const UNITS_PER_SEC: u64 = 10_000_000;

/// Listing built from `sysinfo`. Kernel and user time are not reported
/// separately, so all CPU time lands in `user_time`.
struct SysinfoListing {
    sys: System,
}

impl SysinfoListing {
    fn new() -> Self {
        SysinfoListing { sys: System::new() }
    }
}

impl ListingSource for SysinfoListing {
    fn query(&mut self, buf: &mut [u8]) -> Result<QueryOutcome, SourceError> {
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_cpu()
                .with_memory()
                .with_disk_usage()
                .with_exe(UpdateKind::OnlyIfNotSet),
        );
        let mut writer = ListingWriter::new(buf);
        for (pid, process) in self.sys.processes() {
            let name = process.name().to_string_lossy();
            let disk = process.disk_usage();
            writer.push(&ListingEntry {
                pid: pid.as_u32(),
                parent_pid: process.parent().map(|p| p.as_u32()).unwrap_or(0),
                session_id: process.session_id().map(|s| s.as_u32()).unwrap_or(0),
                create_time: process.start_time().saturating_mul(UNITS_PER_SEC),
                user_time: process.accumulated_cpu_time().saturating_mul(UNITS_PER_MS),
                working_set: process.memory(),
                virtual_size: process.virtual_memory(),
                read_transfer: disk.total_read_bytes,
                write_transfer: disk.total_written_bytes,
                name: &name,
                ..ListingEntry::default()
            });
        }
        Ok(writer.finish())
    }

    fn executable_path(&self, pid: u32) -> Option<PathBuf> {
        self.sys
            .process(Pid::from_u32(pid))
            .and_then(|p| p.exe())
            .map(PathBuf::from)
    }
}

struct NoServices;

impl ServiceSource for NoServices {
    fn enumerate(&mut self) -> Result<ServiceMembership, SourceError> {
        Err(SourceError::Unsupported("service enumeration"))
    }
}

struct SysinfoProbe {
    sys: System,
}

impl SysinfoProbe {
    fn new() -> Self {
        SysinfoProbe { sys: System::new() }
    }
}

impl MachineProbe for SysinfoProbe {
    /// Commit figures approximate physical memory plus swap.
    fn memory(&mut self) -> Result<MemoryStatus, SourceError> {
        self.sys
            .refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram().with_swap());
        let total = self.sys.total_memory();
        let available = self.sys.available_memory();
        Ok(MemoryStatus {
            total_physical: total,
            available_physical: available,
            commit_limit: total.saturating_add(self.sys.total_swap()),
            commit_available: available.saturating_add(self.sys.free_swap()),
        })
    }

    fn fixed_drives(&mut self) -> Result<Vec<DriveInfo>, SourceError> {
        sysinfo_fixed_drives()
    }

    fn disk_busy(&mut self) -> Result<DiskBusySample, SourceError> {
        Err(SourceError::Unsupported("disk busy time"))
    }
}
