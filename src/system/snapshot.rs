use serde::Serialize;

use super::identity::ProcessIdentity;
use super::metrics::SystemAggregateStats;

/// Result of one delta cycle.
///
/// Root and top-CPU entries are identities into the engine's process tree;
/// the same identity refers to the same node on every later cycle in which
/// the process is still alive.
#[derive(Clone, Debug, Serialize)]
pub struct SystemSnapshot {
    pub generation: u64,
    pub roots: Vec<ProcessIdentity>,
    pub top_cpu: Vec<ProcessIdentity>,
    pub process_count: usize,
    pub created: usize,
    pub removed: usize,
    /// The listing ended on a malformed record; the tree holds a prefix.
    pub truncated: bool,
    pub stats: SystemAggregateStats,
}
