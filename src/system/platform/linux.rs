use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SourceError;
use crate::system::buffer::{ListingSource, QueryOutcome};
use crate::system::layout::{ListingEntry, ListingWriter};
use crate::system::metrics::{DiskBusySample, DriveInfo, MachineProbe, MemoryStatus};
use crate::system::services::{ServiceMembership, ServiceSource};

use super::{PlatformExtensions, sysinfo_fixed_drives};

pub struct Platform;

impl PlatformExtensions for Platform {
    fn listing_source() -> Box<dyn ListingSource> {
        Box::new(ProcfsListing::new())
    }

    fn service_source() -> Box<dyn ServiceSource> {
        Box::new(SystemdServices)
    }

    fn machine_probe() -> Box<dyn MachineProbe> {
        Box::new(ProcfsProbe)
    }
}

const UNITS_PER_SEC: u64 = 10_000_000;

/// Encodes `/proc` into the kernel listing layout.
struct ProcfsListing {
    units_per_tick: u64,
    page_size: u64,
}

impl ProcfsListing {
    fn new() -> Self {
        // SAFETY: sysconf has no preconditions and only reads configuration.
        let (ticks, page_size) =
            unsafe { (libc::sysconf(libc::_SC_CLK_TCK), libc::sysconf(libc::_SC_PAGESIZE)) };
        let ticks = if ticks > 0 { ticks as u64 } else { 100 };
        Self {
            units_per_tick: UNITS_PER_SEC / ticks,
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
        }
    }
}

impl ListingSource for ProcfsListing {
    fn query(&mut self, buf: &mut [u8]) -> Result<QueryOutcome, SourceError> {
        let mut writer = ListingWriter::new(buf);
        for entry in fs::read_dir("/proc")?.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let dir = entry.path();
            // The process may exit between readdir and here.
            let Some(stat) = fs::read_to_string(dir.join("stat"))
                .ok()
                .and_then(|contents| parse_stat(&contents))
            else {
                continue;
            };

            // io and fd are owner-only: other users' processes read as zero.
            let (read_transfer, write_transfer) = read_io(&dir);
            writer.push(&ListingEntry {
                pid,
                parent_pid: stat.ppid,
                thread_count: stat.threads,
                handle_count: count_fds(&dir),
                session_id: stat.session,
                base_priority: stat.priority,
                create_time: stat.start_ticks.saturating_mul(self.units_per_tick),
                kernel_time: stat.stime.saturating_mul(self.units_per_tick),
                user_time: stat.utime.saturating_mul(self.units_per_tick),
                working_set: stat.rss_pages.saturating_mul(self.page_size),
                private_bytes: private_pages(&dir).saturating_mul(self.page_size),
                virtual_size: stat.vsize,
                read_transfer,
                write_transfer,
                other_transfer: 0,
                name: &stat.name,
            });
        }
        Ok(writer.finish())
    }

    fn executable_path(&self, pid: u32) -> Option<PathBuf> {
        fs::read_link(format!("/proc/{pid}/exe")).ok()
    }
}

#[derive(Debug, PartialEq)]
struct ProcStat {
    name: String,
    ppid: u32,
    session: u32,
    utime: u64,
    stime: u64,
    priority: i32,
    threads: u32,
    start_ticks: u64,
    vsize: u64,
    rss_pages: u64,
}

fn parse_stat(contents: &str) -> Option<ProcStat> {
    // comm may contain spaces and parens, so split on the outermost pair.
    let open = contents.find('(')?;
    let close = contents.rfind(')')?;
    let name = contents.get(open + 1..close)?.to_string();
    let fields: Vec<&str> = contents.get(close + 1..)?.split_whitespace().collect();
    // Fields after comm: state(0) ppid(1) pgrp(2) session(3) tty_nr(4)
    // tpgid(5) flags(6) minflt(7) cminflt(8) majflt(9) cmajflt(10)
    // utime(11) stime(12) cutime(13) cstime(14) priority(15) nice(16)
    // num_threads(17) itrealvalue(18) starttime(19) vsize(20) rss(21)
    let field = |i: usize| fields.get(i).copied().unwrap_or("0");
    Some(ProcStat {
        name,
        ppid: fields.get(1)?.parse().ok()?,
        session: field(3).parse().unwrap_or(0),
        utime: field(11).parse().unwrap_or(0),
        stime: field(12).parse().unwrap_or(0),
        priority: field(15).parse().unwrap_or(0),
        threads: field(17).parse().unwrap_or(0),
        start_ticks: field(19).parse().unwrap_or(0),
        vsize: field(20).parse().unwrap_or(0),
        rss_pages: field(21).parse().unwrap_or(0),
    })
}

/// `(rchar, wchar)`: all bytes moved through read/write calls, the closest
/// match to Windows transfer counts.
fn read_io(dir: &Path) -> (u64, u64) {
    let Ok(contents) = fs::read_to_string(dir.join("io")) else {
        return (0, 0);
    };
    let mut read = 0;
    let mut write = 0;
    for line in contents.lines() {
        if let Some(val) = line.strip_prefix("rchar: ") {
            read = val.trim().parse().unwrap_or(0);
        } else if let Some(val) = line.strip_prefix("wchar: ") {
            write = val.trim().parse().unwrap_or(0);
        }
    }
    (read, write)
}

fn count_fds(dir: &Path) -> u32 {
    fs::read_dir(dir.join("fd"))
        .map(|entries| entries.count() as u32)
        .unwrap_or(0)
}

/// Resident pages not shared with other processes, from statm.
fn private_pages(dir: &Path) -> u64 {
    let Ok(contents) = fs::read_to_string(dir.join("statm")) else {
        return 0;
    };
    let mut fields = contents.split_whitespace().skip(1);
    let resident: u64 = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    let shared: u64 = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    resident.saturating_sub(shared)
}

/// Processes inside a systemd `*.service` unit of the system slice.
struct SystemdServices;

impl ServiceSource for SystemdServices {
    fn enumerate(&mut self) -> Result<ServiceMembership, SourceError> {
        let mut membership = ServiceMembership::new();
        for entry in fs::read_dir("/proc")?.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let dir = entry.path();
            let Ok(cgroup) = fs::read_to_string(dir.join("cgroup")) else {
                continue;
            };
            if service_unit(&cgroup).is_none() {
                continue;
            }
            membership.insert_pid(pid);
            if let Ok(comm) = fs::read_to_string(dir.join("comm")) {
                membership.insert_name(comm.trim());
            }
        }
        Ok(membership)
    }
}

fn service_unit(cgroup: &str) -> Option<&str> {
    // cgroup v2: single line "0::/path/to/group"
    // cgroup v1: multiple lines "hierarchy-id:controller-list:path"
    for line in cgroup.lines() {
        let Some(path) = line.splitn(3, ':').nth(2) else {
            continue;
        };
        let Some(rest) = path.strip_prefix("/system.slice/") else {
            continue;
        };
        if let Some(unit) = rest.split('/').next()
            && unit.ends_with(".service")
        {
            return Some(unit);
        }
    }
    None
}

struct ProcfsProbe;

impl MachineProbe for ProcfsProbe {
    fn memory(&mut self) -> Result<MemoryStatus, SourceError> {
        let contents = fs::read_to_string("/proc/meminfo")?;
        Ok(parse_meminfo(&contents))
    }

    fn fixed_drives(&mut self) -> Result<Vec<DriveInfo>, SourceError> {
        sysinfo_fixed_drives()
    }

    fn disk_busy(&mut self) -> Result<DiskBusySample, SourceError> {
        let contents = fs::read_to_string("/proc/diskstats")?;
        Ok(parse_diskstats(&contents, |name| {
            Path::new("/sys/block").join(name).exists()
        }))
    }
}

fn parse_meminfo(contents: &str) -> MemoryStatus {
    let mut total = 0;
    let mut available = 0;
    let mut commit_limit = 0;
    let mut committed = 0;
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let bytes = value.parse::<u64>().unwrap_or(0).saturating_mul(1024);
        match key {
            "MemTotal:" => total = bytes,
            "MemAvailable:" => available = bytes,
            "CommitLimit:" => commit_limit = bytes,
            "Committed_AS:" => committed = bytes,
            _ => {}
        }
    }
    MemoryStatus {
        total_physical: total,
        available_physical: available,
        commit_limit,
        commit_available: commit_limit.saturating_sub(committed),
    }
}

/// Device-mapper, loop and RAM disks sit on top of (or beside) physical
/// disks and would double-count or dilute the busy share.
const VIRTUAL_DISK_PREFIXES: [&str; 7] = ["loop", "ram", "zram", "dm-", "md", "sr", "fd"];

fn parse_diskstats(contents: &str, is_whole_disk: impl Fn(&str) -> bool) -> DiskBusySample {
    let mut sample = DiskBusySample::default();
    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // major(0) minor(1) name(2) ... io_ticks(12)
        let (Some(name), Some(io_ticks)) = (fields.get(2), fields.get(12)) else {
            continue;
        };
        if VIRTUAL_DISK_PREFIXES.iter().any(|p| name.starts_with(p)) || !is_whole_disk(name) {
            continue;
        }
        sample.busy_ms = sample
            .busy_ms
            .saturating_add(io_ticks.parse().unwrap_or(0));
        sample.devices += 1;
    }
    sample
}
