use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde::Serialize;

use super::identity::ProcessIdentity;
use super::parser::RawProcessRecord;

/// CPU times in the listing are counted in 100 ns units.
pub const CPU_TIME_UNITS_PER_SEC: f64 = 10_000_000.0;

/// Counters remembered from the previous sample of one process.
#[derive(Debug, Clone, Copy)]
pub struct DeltaHistoryEntry {
    pub cpu_time: u64,
    pub transfer_bytes: u64,
    pub sampled_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProcessRates {
    /// Share of the whole machine, `0.0..=100.0`.
    pub cpu_percent: f32,
    pub io_bytes_per_sec: u64,
}

/// Single-interval rate computation against the previous sample.
#[derive(Debug)]
pub struct DeltaEngine {
    entries: HashMap<ProcessIdentity, DeltaHistoryEntry>,
    logical_processors: u32,
}

impl DeltaEngine {
    pub fn new(logical_processors: u32) -> Self {
        Self {
            entries: HashMap::new(),
            logical_processors: logical_processors.max(1),
        }
    }

    pub fn logical_processors(&self) -> u32 {
        self.logical_processors
    }

    pub fn compute_metrics(&mut self, record: &RawProcessRecord<'_>, now: Instant) -> ProcessRates {
        self.compute(
            record.identity(),
            record.cpu_time(),
            record.transfer_bytes(),
            now,
        )
    }

    /// Rates since the previous sample of `identity`, then stores the current
    /// counters as the next baseline. A first observation yields zero rates.
    pub fn compute(
        &mut self,
        identity: ProcessIdentity,
        cpu_time: u64,
        transfer_bytes: u64,
        now: Instant,
    ) -> ProcessRates {
        let current = DeltaHistoryEntry {
            cpu_time,
            transfer_bytes,
            sampled_at: now,
        };
        let Some(previous) = self.entries.insert(identity, current) else {
            return ProcessRates::default();
        };

        let wall_secs = now
            .checked_duration_since(previous.sampled_at)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        ProcessRates {
            cpu_percent: cpu_percent(
                cpu_time.checked_sub(previous.cpu_time),
                wall_secs,
                self.logical_processors,
            ),
            io_bytes_per_sec: bytes_per_sec(
                transfer_bytes.checked_sub(previous.transfer_bytes),
                wall_secs,
            ),
        }
    }

    pub fn get(&self, identity: &ProcessIdentity) -> Option<&DeltaHistoryEntry> {
        self.entries.get(identity)
    }

    pub fn contains(&self, identity: &ProcessIdentity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn forget(&mut self, identity: &ProcessIdentity) -> bool {
        self.entries.remove(identity).is_some()
    }

    /// Drop every entry whose identity is not in `alive`.
    pub fn retain_alive(&mut self, alive: &HashSet<ProcessIdentity>) {
        self.entries.retain(|identity, _| alive.contains(identity));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `cpu_delta` is in 100 ns units; `None` means the counter went backwards.
pub fn cpu_percent(cpu_delta: Option<u64>, wall_secs: f64, logical_processors: u32) -> f32 {
    let Some(cpu_delta) = cpu_delta else {
        return 0.0;
    };
    if wall_secs <= 0.0 || !wall_secs.is_finite() {
        return 0.0;
    }
    let busy_secs = cpu_delta as f64 / CPU_TIME_UNITS_PER_SEC;
    let percent = busy_secs / wall_secs / f64::from(logical_processors.max(1)) * 100.0;
    if percent.is_finite() {
        percent.clamp(0.0, 100.0) as f32
    } else {
        0.0
    }
}

pub fn bytes_per_sec(delta: Option<u64>, wall_secs: f64) -> u64 {
    match delta {
        Some(delta) if wall_secs > 0.0 && wall_secs.is_finite() => {
            (delta as f64 / wall_secs) as u64
        }
        _ => 0,
    }
}
