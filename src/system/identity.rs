use std::fmt;

use serde::Serialize;

/// Stable key for one process instance: `(pid, creation time)`.
///
/// Process ids are recycled by the OS, so a pid alone cannot key state that
/// survives across refresh cycles. Creation time is in 100 ns units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub created: u64,
}

impl ProcessIdentity {
    pub const fn new(pid: u32, created: u64) -> Self {
        Self { pid, created }
    }

    /// True when `self` could be the parent of `child`: a parent never starts
    /// after its child. Equal timestamps are allowed because coarse clocks
    /// (procfs start times are in clock ticks) give fork-and-exec pairs the
    /// same value.
    pub fn may_parent(&self, child: &ProcessIdentity) -> bool {
        self.pid != child.pid && self.created <= child.created
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_pid_different_start_is_a_different_identity() {
        let first = ProcessIdentity::new(100, 10);
        let reused = ProcessIdentity::new(100, 20);
        assert_ne!(first, reused);
        assert_eq!(first, ProcessIdentity::new(100, 10));
    }

    #[test]
    fn parent_must_not_start_after_child() {
        let parent = ProcessIdentity::new(1, 5);
        let child = ProcessIdentity::new(2, 5);
        let newer = ProcessIdentity::new(3, 9);
        assert!(parent.may_parent(&child));
        assert!(!newer.may_parent(&child));
        assert!(!parent.may_parent(&parent));
    }
}
