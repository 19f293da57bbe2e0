use std::time::Instant;

use serde::Serialize;

use crate::error::SourceError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStatus {
    pub total_physical: u64,
    pub available_physical: u64,
    /// Commit limit: physical memory plus page file / swap.
    pub commit_limit: u64,
    pub commit_available: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DriveInfo {
    /// Drive letter on Windows (`"C:"`), mount point elsewhere.
    pub label: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Cumulative busy time summed over physical disks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskBusySample {
    pub busy_ms: u64,
    pub devices: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SystemAggregateStats {
    pub total_physical: u64,
    pub available_physical: u64,
    pub commit_limit: u64,
    pub commit_available: u64,
    pub disk_active_percent: f32,
    pub drives: Vec<DriveInfo>,
}

impl SystemAggregateStats {
    pub fn used_physical(&self) -> u64 {
        self.total_physical.saturating_sub(self.available_physical)
    }

    pub fn committed(&self) -> u64 {
        self.commit_limit.saturating_sub(self.commit_available)
    }
}

/// Machine-wide queries, each independently fallible.
pub trait MachineProbe: Send {
    fn memory(&mut self) -> Result<MemoryStatus, SourceError>;
    /// Fixed local drives only; removable and network media are skipped.
    fn fixed_drives(&mut self) -> Result<Vec<DriveInfo>, SourceError>;
    fn disk_busy(&mut self) -> Result<DiskBusySample, SourceError>;
}

pub struct SystemMetricsCollector {
    probe: Box<dyn MachineProbe>,
    last_disk: Option<(DiskBusySample, Instant)>,
}

impl SystemMetricsCollector {
    pub fn new(probe: Box<dyn MachineProbe>) -> Self {
        Self {
            probe,
            last_disk: None,
        }
    }

    /// A failing sub-query zeroes only its own fields.
    pub fn collect(&mut self, now: Instant) -> SystemAggregateStats {
        let _span = tracing::debug_span!("metrics.collect").entered();
        let mut stats = SystemAggregateStats::default();

        match self.probe.memory() {
            Ok(memory) => {
                stats.total_physical = memory.total_physical;
                stats.available_physical = memory.available_physical;
                stats.commit_limit = memory.commit_limit;
                stats.commit_available = memory.commit_available;
            }
            Err(err) => tracing::warn!(error = %err, "memory query failed"),
        }

        match self.probe.fixed_drives() {
            Ok(drives) => stats.drives = drives,
            Err(err) => tracing::warn!(error = %err, "drive enumeration failed"),
        }

        match self.probe.disk_busy() {
            Ok(sample) => {
                if let Some((previous, at)) = self.last_disk {
                    let wall_ms = now
                        .checked_duration_since(at)
                        .map(|d| d.as_secs_f64() * 1000.0)
                        .unwrap_or(0.0);
                    stats.disk_active_percent = disk_active_percent(previous, sample, wall_ms);
                }
                self.last_disk = Some((sample, now));
            }
            Err(err) => {
                tracing::debug!(error = %err, "disk activity unavailable");
                self.last_disk = None;
            }
        }

        stats
    }
}

/// Average busy share across devices over the interval, `0.0..=100.0`.
pub fn disk_active_percent(previous: DiskBusySample, current: DiskBusySample, wall_ms: f64) -> f32 {
    if wall_ms <= 0.0 || current.devices == 0 {
        return 0.0;
    }
    let Some(busy) = current.busy_ms.checked_sub(previous.busy_ms) else {
        return 0.0;
    };
    let percent = busy as f64 / (wall_ms * f64::from(current.devices)) * 100.0;
    if percent.is_finite() {
        percent.clamp(0.0, 100.0) as f32
    } else {
        0.0
    }
}
