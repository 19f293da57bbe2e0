use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::error::SourceError;

/// Processes hosting OS-managed background services.
///
/// Membership is by pid or by image name; names are compared
/// case-insensitively and stored upper-cased.
#[derive(Debug, Clone, Default)]
pub struct ServiceMembership {
    pids: HashSet<u32>,
    names: HashSet<String>,
}

impl ServiceMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pid(&mut self, pid: u32) {
        if pid != 0 {
            self.pids.insert(pid);
        }
    }

    pub fn insert_name(&mut self, name: &str) {
        if !name.is_empty() {
            self.names.insert(name_key(name));
        }
    }

    /// `name_key` must already be upper-cased (see [`name_key`]).
    pub fn contains(&self, pid: u32, name_key: &str) -> bool {
        self.pids.contains(&pid) || self.names.contains(name_key)
    }

    pub fn pid_count(&self) -> usize {
        self.pids.len()
    }

    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty() && self.names.is_empty()
    }
}

/// Upper-cased form used for case-insensitive ordinal comparison.
pub fn name_key(name: &str) -> String {
    name.chars().flat_map(char::to_uppercase).collect()
}

pub trait ServiceSource: Send {
    fn enumerate(&mut self) -> Result<ServiceMembership, SourceError>;
}

/// Caches service membership and refreshes it on a slower cadence than the
/// process snapshot.
pub struct ServiceClassifier {
    source: Box<dyn ServiceSource>,
    membership: ServiceMembership,
    refresh_interval: Duration,
    last_refresh: Option<Instant>,
}

impl ServiceClassifier {
    pub fn new(source: Box<dyn ServiceSource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            membership: ServiceMembership::default(),
            refresh_interval,
            last_refresh: None,
        }
    }

    pub fn membership(&self) -> &ServiceMembership {
        &self.membership
    }

    /// Re-enumerate now. A failed enumeration leaves the membership empty.
    pub fn refresh(&mut self, now: Instant) -> &ServiceMembership {
        let _span = tracing::debug_span!("services.refresh").entered();
        self.membership = match self.source.enumerate() {
            Ok(membership) => {
                tracing::debug!(
                    pids = membership.pid_count(),
                    names = membership.name_count(),
                    "service membership refreshed"
                );
                membership
            }
            Err(err) => {
                tracing::warn!(error = %err, "service enumeration failed; no process marked as service");
                ServiceMembership::default()
            }
        };
        self.last_refresh = Some(now);
        &self.membership
    }

    pub fn refresh_if_due(&mut self, now: Instant) -> &ServiceMembership {
        let due = match self.last_refresh {
            None => true,
            Some(last) => now
                .checked_duration_since(last)
                .is_some_and(|elapsed| elapsed >= self.refresh_interval),
        };
        if due {
            self.refresh(now)
        } else {
            &self.membership
        }
    }
}
