use std::time::Instant;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::EngineResult;

use super::buffer::{ListingSource, SnapshotBuffer};
use super::delta::DeltaEngine;
use super::identity::ProcessIdentity;
use super::metrics::{MachineProbe, SystemMetricsCollector};
use super::platform;
use super::process::{ProcessNode, ProcessTree};
use super::services::{ServiceClassifier, ServiceSource};
use super::snapshot::SystemSnapshot;

/// OS-facing collaborators of the engine.
pub struct EngineParts {
    pub listing: Box<dyn ListingSource>,
    pub services: Box<dyn ServiceSource>,
    pub probe: Box<dyn MachineProbe>,
    pub logical_processors: u32,
}

impl EngineParts {
    /// Backends for the platform this binary was built for.
    pub fn native() -> Self {
        EngineParts {
            listing: platform::listing_source(),
            services: platform::service_source(),
            probe: platform::machine_probe(),
            logical_processors: num_cpus::get() as u32,
        }
    }
}

struct EngineState {
    listing: Box<dyn ListingSource>,
    buffer: SnapshotBuffer,
    deltas: DeltaEngine,
    tree: ProcessTree,
    services: ServiceClassifier,
    metrics: SystemMetricsCollector,
    generation: u64,
}

/// Runs acquire → parse → delta → reconcile → collect as one cycle.
///
/// All state sits behind a single mutex held for the whole cycle, so
/// concurrent callers are serialized behind the cycle in flight. Lookups for
/// user actions take the same lock.
pub struct SnapshotEngine {
    state: Mutex<EngineState>,
}

impl SnapshotEngine {
    pub fn new(config: &Config) -> Self {
        Self::with_parts(config, EngineParts::native())
    }

    pub fn with_parts(config: &Config, parts: EngineParts) -> Self {
        let state = EngineState {
            listing: parts.listing,
            buffer: SnapshotBuffer::from_config(&config.engine),
            deltas: DeltaEngine::new(parts.logical_processors),
            tree: ProcessTree::new(config.engine.top_n),
            services: ServiceClassifier::new(parts.services, config.services.refresh_interval()),
            metrics: SystemMetricsCollector::new(parts.probe),
            generation: 0,
        };
        SnapshotEngine {
            state: Mutex::new(state),
        }
    }

    pub fn produce_snapshot(&self) -> EngineResult<SystemSnapshot> {
        self.produce_snapshot_with(|_, snapshot| snapshot.clone())
    }

    /// Run one cycle and hand `read` the reconciled tree while the lock is
    /// still held.
    pub fn produce_snapshot_with<R>(
        &self,
        read: impl FnOnce(&ProcessTree, &SystemSnapshot) -> R,
    ) -> EngineResult<R> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let generation = state.generation + 1;
        let _span = tracing::info_span!("engine.cycle", generation).entered();

        let listing = state.buffer.acquire(state.listing.as_mut())?;
        let now = Instant::now();
        let services = state.services.refresh_if_due(now);
        let mut records = listing.records();
        let source = &state.listing;
        let mut summary = state.tree.merge(
            &mut records,
            services,
            &mut state.deltas,
            |pid| source.executable_path(pid),
            now,
        );
        let truncated = records.truncated();
        if truncated {
            tracing::warn!(
                listing_bytes = listing.len(),
                parsed = summary.observed,
                "process listing truncated at a malformed record, skipping prune"
            );
        }
        // A truncated walk says nothing about the records past the break.
        state.tree.settle(&mut summary, &mut state.deltas, !truncated);

        let stats = state.metrics.collect(now);
        state.generation = generation;

        let snapshot = SystemSnapshot {
            generation,
            roots: state.tree.roots().to_vec(),
            top_cpu: state.tree.top_cpu().to_vec(),
            process_count: state.tree.len(),
            created: summary.created,
            removed: summary.removed,
            truncated,
            stats,
        };
        tracing::debug!(
            processes = snapshot.process_count,
            created = snapshot.created,
            removed = snapshot.removed,
            "snapshot produced"
        );
        Ok(read(&state.tree, &snapshot))
    }

    pub fn with_tree<R>(&self, read: impl FnOnce(&ProcessTree) -> R) -> R {
        read(&self.state.lock().tree)
    }

    /// Copy of the node for `identity`, for user-initiated actions.
    pub fn node(&self, identity: &ProcessIdentity) -> Option<ProcessNode> {
        self.state.lock().tree.get(identity).cloned()
    }

    pub fn find_by_pid(&self, pid: u32) -> Option<ProcessIdentity> {
        self.state
            .lock()
            .tree
            .find_by_pid(pid)
            .map(|node| node.identity)
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().deltas.len()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}
