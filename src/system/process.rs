use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;

use super::delta::DeltaEngine;
use super::identity::ProcessIdentity;
use super::parser::RawProcessRecord;
use super::services::{ServiceMembership, name_key};

pub const DEFAULT_TOP_N: usize = 5;

/// Handle assigned once per process instance. Unchanged for as long as the
/// identity keeps being observed; never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(u64);

impl NodeId {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ProcessNode {
    pub id: NodeId,
    pub identity: ProcessIdentity,
    pub name: String,
    pub executable_path: Option<PathBuf>,
    pub parent_pid: u32,
    /// Back-reference only; resolved to a live node or `None` (root).
    pub parent: Option<ProcessIdentity>,
    pub children: Vec<ProcessIdentity>,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub virtual_memory_bytes: u64,
    pub private_bytes: u64,
    pub io_bytes_per_sec: u64,
    pub thread_count: u32,
    pub handle_count: u32,
    pub session_id: u32,
    pub is_service: bool,
    #[serde(skip)]
    sort_key: String,
}

impl ProcessNode {
    fn new(id: NodeId, record: &RawProcessRecord<'_>, executable_path: Option<PathBuf>) -> Self {
        let name = display_name(record);
        ProcessNode {
            id,
            identity: record.identity(),
            sort_key: name_key(&name),
            name,
            executable_path,
            parent_pid: record.parent_pid,
            parent: None,
            children: Vec::new(),
            cpu_percent: 0.0,
            memory_bytes: 0,
            virtual_memory_bytes: 0,
            private_bytes: 0,
            io_bytes_per_sec: 0,
            thread_count: 0,
            handle_count: 0,
            session_id: 0,
            is_service: false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.identity.pid
    }
}

fn display_name(record: &RawProcessRecord<'_>) -> String {
    if !record.name.is_empty() {
        record.name.to_string_lossy()
    } else if record.pid == 0 {
        "System Idle Process".to_string()
    } else {
        format!("[{}]", record.pid)
    }
}

/// Case-insensitive ordinal order on display names.
fn by_name(
    nodes: &HashMap<ProcessIdentity, ProcessNode>,
    a: &ProcessIdentity,
    b: &ProcessIdentity,
) -> Ordering {
    match (nodes.get(a), nodes.get(b)) {
        (Some(a), Some(b)) => a.sort_key.cmp(&b.sort_key),
        _ => Ordering::Equal,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub observed: usize,
    pub created: usize,
    pub removed: usize,
}

/// Persistent process tree, reconciled in place once per cycle.
///
/// Sole owner and mutator of every [`ProcessNode`]. Consumers read through
/// `&ProcessTree` and keep [`ProcessIdentity`] or [`NodeId`] values across
/// cycles, never their own copies of nodes.
#[derive(Debug)]
pub struct ProcessTree {
    nodes: HashMap<ProcessIdentity, ProcessNode>,
    roots: Vec<ProcessIdentity>,
    top_cpu: Vec<ProcessIdentity>,
    top_n: usize,
    next_id: u64,
    // Per-cycle scratch, kept to reuse allocations.
    seen: HashSet<ProcessIdentity>,
    order: Vec<ProcessIdentity>,
    by_pid: HashMap<u32, ProcessIdentity>,
}

impl Default for ProcessTree {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_N)
    }
}

impl ProcessTree {
    pub fn new(top_n: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            roots: Vec::new(),
            top_cpu: Vec::with_capacity(top_n),
            top_n,
            next_id: 1,
            seen: HashSet::new(),
            order: Vec::new(),
            by_pid: HashMap::new(),
        }
    }

    /// Merge one cycle's records into the tree.
    ///
    /// Nodes are updated in place; identities missing from `records` lose both
    /// their node and their delta history here and nowhere else.
    pub fn reconcile<'a, I, P>(
        &mut self,
        records: I,
        services: &ServiceMembership,
        deltas: &mut DeltaEngine,
        resolve_path: P,
        now: Instant,
    ) -> ReconcileSummary
    where
        I: IntoIterator<Item = RawProcessRecord<'a>>,
        P: FnMut(u32) -> Option<PathBuf>,
    {
        let mut summary = self.merge(records, services, deltas, resolve_path, now);
        self.settle(&mut summary, deltas, true);
        summary
    }

    /// Upsert every record without touching identities the records omit.
    /// Follow with [`ProcessTree::settle`] to finish the cycle.
    pub fn merge<'a, I, P>(
        &mut self,
        records: I,
        services: &ServiceMembership,
        deltas: &mut DeltaEngine,
        mut resolve_path: P,
        now: Instant,
    ) -> ReconcileSummary
    where
        I: IntoIterator<Item = RawProcessRecord<'a>>,
        P: FnMut(u32) -> Option<PathBuf>,
    {
        let _span = tracing::debug_span!("tree.reconcile").entered();
        let mut summary = ReconcileSummary::default();
        self.seen.clear();
        self.order.clear();

        for record in records {
            let identity = record.identity();
            if !self.seen.insert(identity) {
                continue;
            }
            self.order.push(identity);

            let rates = deltas.compute_metrics(&record, now);
            let node = match self.nodes.entry(identity) {
                Entry::Occupied(occupied) => {
                    let node = occupied.into_mut();
                    // exec keeps the identity but replaces the image.
                    let name = display_name(&record);
                    if name != node.name {
                        node.sort_key = name_key(&name);
                        node.name = name;
                        node.executable_path = resolve_path(record.pid);
                    }
                    node
                }
                Entry::Vacant(vacant) => {
                    let id = NodeId(self.next_id);
                    self.next_id += 1;
                    summary.created += 1;
                    vacant.insert(ProcessNode::new(id, &record, resolve_path(record.pid)))
                }
            };
            node.parent_pid = record.parent_pid;
            node.cpu_percent = rates.cpu_percent;
            node.io_bytes_per_sec = rates.io_bytes_per_sec;
            node.memory_bytes = record.working_set;
            node.virtual_memory_bytes = record.virtual_size;
            node.private_bytes = record.private_bytes;
            node.thread_count = record.thread_count;
            node.handle_count = record.handle_count;
            node.session_id = record.session_id;
            node.is_service = services.contains(record.pid, &node.sort_key);
        }
        summary.observed = self.order.len();
        summary
    }

    /// Finish a cycle started by [`ProcessTree::merge`]: prune identities the
    /// merge did not see (when `prune` is set), then relink, sort and rank.
    ///
    /// Without `prune`, unseen nodes and their delta history are carried into
    /// this cycle's tree unchanged.
    pub fn settle(
        &mut self,
        summary: &mut ReconcileSummary,
        deltas: &mut DeltaEngine,
        prune: bool,
    ) {
        if prune {
            let before = self.nodes.len();
            let seen = &self.seen;
            self.nodes.retain(|identity, _| seen.contains(identity));
            deltas.retain_alive(seen);
            summary.removed = before - self.nodes.len();
        } else {
            let mut carried: Vec<ProcessIdentity> = self
                .nodes
                .keys()
                .filter(|identity| !self.seen.contains(identity))
                .copied()
                .collect();
            carried.sort_unstable();
            self.order.extend(carried);
        }

        self.relink();
        self.sort_siblings();
        self.select_top_cpu();

        tracing::debug!(
            observed = summary.observed,
            created = summary.created,
            removed = summary.removed,
            pruned = prune,
            roots = self.roots.len(),
            "tree reconciled"
        );
    }

    fn relink(&mut self) {
        self.by_pid.clear();
        for identity in &self.order {
            let slot = self.by_pid.entry(identity.pid).or_insert(*identity);
            if identity.created > slot.created {
                *slot = *identity;
            }
        }

        for node in self.nodes.values_mut() {
            node.children.clear();
        }
        self.roots.clear();

        for identity in &self.order {
            let parent = self.nodes.get(identity).and_then(|node| {
                if node.parent_pid == 0 {
                    return None;
                }
                self.by_pid
                    .get(&node.parent_pid)
                    .filter(|candidate| candidate.may_parent(identity))
                    .copied()
            });
            if let Some(node) = self.nodes.get_mut(identity) {
                node.parent = parent;
            }
        }

        self.break_cycles();

        for identity in &self.order {
            match self.nodes.get(identity).and_then(|node| node.parent) {
                Some(parent) => {
                    if let Some(parent) = self.nodes.get_mut(&parent) {
                        parent.children.push(*identity);
                    }
                }
                None => self.roots.push(*identity),
            }
        }
    }

    /// Equal creation times make the parent check non-strict, so a corrupt
    /// listing could describe a loop. Cut it where it is first detected.
    fn break_cycles(&mut self) {
        let mut settled: HashSet<ProcessIdentity> = HashSet::with_capacity(self.order.len());
        let mut path: Vec<ProcessIdentity> = Vec::new();

        for start in &self.order {
            path.clear();
            let mut current = *start;
            loop {
                if settled.contains(&current) {
                    break;
                }
                if path.contains(&current) {
                    if let Some(node) = self.nodes.get_mut(&current) {
                        tracing::warn!(process = %current, "parent cycle broken");
                        node.parent = None;
                    }
                    break;
                }
                path.push(current);
                match self.nodes.get(&current).and_then(|node| node.parent) {
                    Some(parent) => current = parent,
                    None => break,
                }
            }
            settled.extend(path.iter().copied());
        }
    }

    fn sort_siblings(&mut self) {
        let mut roots = mem::take(&mut self.roots);
        roots.sort_by(|a, b| by_name(&self.nodes, a, b));
        self.roots = roots;

        for identity in &self.order {
            let Some(node) = self.nodes.get_mut(identity) else {
                continue;
            };
            if node.children.len() < 2 {
                continue;
            }
            let mut children = mem::take(&mut node.children);
            children.sort_by(|a, b| by_name(&self.nodes, a, b));
            if let Some(node) = self.nodes.get_mut(identity) {
                node.children = children;
            }
        }
    }

    /// Single pass, bounded insertion; earlier encounters win ties.
    fn select_top_cpu(&mut self) {
        let mut top: Vec<(f32, ProcessIdentity)> = Vec::with_capacity(self.top_n + 1);
        for identity in &self.order {
            let Some(node) = self.nodes.get(identity) else {
                continue;
            };
            let cpu = node.cpu_percent;
            if top.len() == self.top_n && top.last().is_none_or(|(lowest, _)| cpu <= *lowest) {
                continue;
            }
            let at = top.iter().position(|(other, _)| cpu > *other).unwrap_or(top.len());
            top.insert(at, (cpu, *identity));
            top.truncate(self.top_n);
        }
        self.top_cpu.clear();
        self.top_cpu.extend(top.into_iter().map(|(_, identity)| identity));
    }

    pub fn get(&self, identity: &ProcessIdentity) -> Option<&ProcessNode> {
        self.nodes.get(identity)
    }

    pub fn contains(&self, identity: &ProcessIdentity) -> bool {
        self.nodes.contains_key(identity)
    }

    /// Live process currently holding `pid`.
    pub fn find_by_pid(&self, pid: u32) -> Option<&ProcessNode> {
        self.by_pid.get(&pid).and_then(|identity| self.nodes.get(identity))
    }

    pub fn roots(&self) -> &[ProcessIdentity] {
        &self.roots
    }

    pub fn root_nodes(&self) -> impl Iterator<Item = &ProcessNode> {
        self.roots.iter().filter_map(|identity| self.nodes.get(identity))
    }

    pub fn children(&self, identity: &ProcessIdentity) -> impl Iterator<Item = &ProcessNode> {
        self.nodes
            .get(identity)
            .map(|node| node.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|child| self.nodes.get(child))
    }

    /// Highest CPU first, at most `top_n` entries.
    pub fn top_cpu(&self) -> &[ProcessIdentity] {
        &self.top_cpu
    }

    pub fn top_cpu_nodes(&self) -> impl Iterator<Item = &ProcessNode> {
        self.top_cpu.iter().filter_map(|identity| self.nodes.get(identity))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `(depth, node)` pairs in display order: roots first, each followed by
    /// its sorted subtree.
    pub fn walk_depth_first(&self) -> Vec<(usize, &ProcessNode)> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(usize, &ProcessIdentity)> =
            self.roots.iter().rev().map(|identity| (0, identity)).collect();
        while let Some((depth, identity)) = stack.pop() {
            let Some(node) = self.nodes.get(identity) else {
                continue;
            };
            out.push((depth, node));
            stack.extend(node.children.iter().rev().map(|child| (depth + 1, child)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::buffer::QueryOutcome;
    use crate::system::layout::{ListingEntry, ListingWriter};
    use crate::system::parser::Listing;

    fn entry(pid: u32, parent_pid: u32, created: u64, name: &str) -> ListingEntry<'_> {
        ListingEntry {
            pid,
            parent_pid,
            create_time: created,
            name,
            ..Default::default()
        }
    }

    fn cycle(
        tree: &mut ProcessTree,
        deltas: &mut DeltaEngine,
        entries: &[ListingEntry<'_>],
    ) -> ReconcileSummary {
        let mut buf = vec![0u8; 64 * 1024];
        let mut writer = ListingWriter::new(&mut buf);
        for entry in entries {
            writer.push(entry);
        }
        let QueryOutcome::Complete(len) = writer.finish() else {
            panic!("test buffer too small");
        };
        let listing = Listing::new(&buf[..len]);
        tree.reconcile(
            listing.records(),
            &ServiceMembership::default(),
            deltas,
            |_| None,
            Instant::now(),
        )
    }

    fn names<'a>(tree: &'a ProcessTree, ids: &[ProcessIdentity]) -> Vec<&'a str> {
        ids.iter()
            .map(|id| tree.get(id).map(|n| n.name.as_str()).unwrap_or("?"))
            .collect()
    }

    #[test]
    fn links_children_and_roots() {
        let mut tree = ProcessTree::default();
        let mut deltas = DeltaEngine::new(1);
        cycle(
            &mut tree,
            &mut deltas,
            &[
                entry(1, 0, 1, "init"),
                entry(2, 1, 2, "worker_a"),
                entry(3, 1, 3, "worker_b"),
                entry(4, 2, 4, "worker_child"),
                entry(8, 4040, 8, "orphan"),
            ],
        );

        assert_eq!(names(&tree, tree.roots()), vec!["init", "orphan"]);
        let init = tree.get(&ProcessIdentity::new(1, 1)).expect("init");
        assert_eq!(names(&tree, &init.children), vec!["worker_a", "worker_b"]);
        let orphan = tree.find_by_pid(8).expect("orphan");
        assert!(orphan.parent.is_none());
    }

    #[test]
    fn parent_started_after_child_is_not_a_parent() {
        let mut tree = ProcessTree::default();
        let mut deltas = DeltaEngine::new(1);
        // pid 50 was recycled by a process newer than its "child".
        cycle(
            &mut tree,
            &mut deltas,
            &[entry(50, 0, 900, "recycled"), entry(60, 50, 100, "survivor")],
        );
        assert_eq!(tree.roots().len(), 2);
        assert!(tree.find_by_pid(60).and_then(|n| n.parent).is_none());
    }

    #[test]
    fn mutual_parents_with_equal_start_do_not_hang() {
        let mut tree = ProcessTree::default();
        let mut deltas = DeltaEngine::new(1);
        cycle(
            &mut tree,
            &mut deltas,
            &[entry(5, 6, 7, "a"), entry(6, 5, 7, "b")],
        );
        assert_eq!(tree.walk_depth_first().len(), 2);
        assert_eq!(tree.roots().len(), 1);
    }

    #[test]
    fn siblings_sort_case_insensitively_and_stably() {
        let mut tree = ProcessTree::default();
        let mut deltas = DeltaEngine::new(1);
        cycle(
            &mut tree,
            &mut deltas,
            &[
                entry(1, 0, 1, "root"),
                entry(2, 1, 2, "zeta"),
                entry(3, 1, 3, "Beta"),
                entry(4, 1, 4, "alpha"),
                entry(5, 1, 5, "BETA"),
            ],
        );
        let root = tree.find_by_pid(1).expect("root");
        assert_eq!(
            names(&tree, &root.children),
            vec!["alpha", "Beta", "BETA", "zeta"]
        );
    }

    #[test]
    fn duplicate_identity_in_one_listing_is_counted_once() {
        let mut tree = ProcessTree::default();
        let mut deltas = DeltaEngine::new(1);
        let summary = cycle(
            &mut tree,
            &mut deltas,
            &[entry(1, 0, 1, "init"), entry(1, 0, 1, "init")],
        );
        assert_eq!(summary.observed, 1);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn empty_name_gets_a_placeholder() {
        let mut tree = ProcessTree::default();
        let mut deltas = DeltaEngine::new(1);
        cycle(
            &mut tree,
            &mut deltas,
            &[entry(0, 0, 0, ""), entry(77, 0, 1, "")],
        );
        assert_eq!(tree.find_by_pid(0).expect("idle").name, "System Idle Process");
        assert_eq!(tree.find_by_pid(77).expect("unnamed").name, "[77]");
    }

    #[test]
    fn exec_under_the_same_identity_renames_the_node() {
        let mut tree = ProcessTree::default();
        let mut deltas = DeltaEngine::new(1);
        let mut services = ServiceMembership::default();
        services.insert_name("java");
        let images = ["/usr/bin/sh", "/usr/bin/java"];
        let mut resolved = 0;

        let mut ids = Vec::new();
        for name in ["start.sh", "java"] {
            let mut buf = vec![0u8; 4096];
            let mut writer = ListingWriter::new(&mut buf);
            writer.push(&entry(1, 0, 1, "init"));
            writer.push(&entry(50, 1, 7, name));
            let QueryOutcome::Complete(len) = writer.finish() else {
                panic!("test buffer too small");
            };
            tree.reconcile(
                Listing::new(&buf[..len]).records(),
                &services,
                &mut deltas,
                |pid| {
                    if pid != 50 {
                        return None;
                    }
                    resolved += 1;
                    Some(PathBuf::from(images[resolved - 1]))
                },
                Instant::now(),
            );
            ids.push(tree.find_by_pid(50).expect("node").id);
        }

        let node = tree.find_by_pid(50).expect("node");
        assert_eq!(ids[0], ids[1]);
        assert_eq!(node.name, "java");
        assert!(node.is_service);
        assert_eq!(node.executable_path, Some(PathBuf::from("/usr/bin/java")));
        assert_eq!(resolved, 2);
    }

    #[test]
    fn settle_without_prune_keeps_unseen_nodes_linked() {
        let mut tree = ProcessTree::default();
        let mut deltas = DeltaEngine::new(1);
        cycle(
            &mut tree,
            &mut deltas,
            &[entry(1, 0, 1, "init"), entry(2, 1, 2, "child")],
        );
        let child_id = tree.find_by_pid(2).expect("child").id;

        let mut buf = vec![0u8; 4096];
        let mut writer = ListingWriter::new(&mut buf);
        writer.push(&entry(1, 0, 1, "init"));
        let QueryOutcome::Complete(len) = writer.finish() else {
            panic!("test buffer too small");
        };
        let mut summary = tree.merge(
            Listing::new(&buf[..len]).records(),
            &ServiceMembership::default(),
            &mut deltas,
            |_| None,
            Instant::now(),
        );
        tree.settle(&mut summary, &mut deltas, false);

        assert_eq!(summary.removed, 0);
        assert_eq!(tree.len(), 2);
        assert_eq!(deltas.len(), 2);
        assert_eq!(tree.find_by_pid(2).expect("child").id, child_id);
        let init = tree.find_by_pid(1).expect("init");
        assert_eq!(names(&tree, &init.children), vec!["child"]);
    }

    #[test]
    fn walk_visits_in_display_order() {
        let mut tree = ProcessTree::default();
        let mut deltas = DeltaEngine::new(1);
        cycle(
            &mut tree,
            &mut deltas,
            &[
                entry(1, 0, 1, "init"),
                entry(3, 1, 3, "b"),
                entry(2, 1, 2, "a"),
                entry(4, 2, 4, "a1"),
            ],
        );
        let walk: Vec<(usize, &str)> = tree
            .walk_depth_first()
            .into_iter()
            .map(|(depth, node)| (depth, node.name.as_str()))
            .collect();
        assert_eq!(walk, vec![(0, "init"), (1, "a"), (2, "a1"), (1, "b")]);
    }
}
