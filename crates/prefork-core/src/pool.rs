//! Supervisor-side bookkeeping of live workers.
//!
//! A [`WorkerSet`] is owned by the supervisor loop and touched by nothing
//! else, so it needs no locking. A pid is present iff the supervisor
//! believes that worker is alive: it is inserted right after a successful
//! spawn and removed when the exit is reaped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::state::Termination;

/// OS process identifier.
pub type ProcessId = i32;

/// One live worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    /// Process id
    pub pid: ProcessId,
    /// Monotonic spawn number, unique for the supervisor's lifetime
    pub serial: u64,
    /// When the supervisor spawned it
    pub spawned_at: Instant,
}

impl WorkerRecord {
    /// Time since spawn.
    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }
}

/// Counters kept across the supervisor's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful spawns
    pub spawned: u64,
    /// Exits of known workers
    pub reaped: u64,
    /// Spawn attempts that failed
    pub spawn_failures: u64,
    /// Exits of pids the supervisor never recorded
    pub unrecognized_exits: u64,
}

/// Alive set for a pool with a fixed target size.
#[derive(Debug)]
pub struct WorkerSet {
    alive: HashMap<ProcessId, WorkerRecord>,
    target: usize,
    next_serial: u64,
    stats: PoolStats,
}

impl WorkerSet {
    /// Create an empty set for a pool of `target` workers.
    pub fn new(target: usize) -> Self {
        Self {
            alive: HashMap::with_capacity(target),
            target,
            next_serial: 0,
            stats: PoolStats::default(),
        }
    }

    /// Record a freshly spawned worker.
    pub fn insert(&mut self, pid: ProcessId) -> &WorkerRecord {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.stats.spawned += 1;

        let record = WorkerRecord { pid, serial, spawned_at: Instant::now() };
        if self.alive.insert(pid, record).is_some() {
            // The kernel only reuses a pid after we reaped it.
            tracing::warn!(pid, "Worker pid recorded twice; replacing stale record");
        }
        &self.alive[&pid]
    }

    /// Remove a reaped worker.
    ///
    /// Returns `None` (and counts it) for a pid that was never recorded.
    pub fn remove(&mut self, pid: ProcessId) -> Option<WorkerRecord> {
        match self.alive.remove(&pid) {
            Some(record) => {
                self.stats.reaped += 1;
                Some(record)
            }
            None => {
                self.stats.unrecognized_exits += 1;
                None
            }
        }
    }

    /// Count a spawn attempt that produced no process.
    pub fn note_spawn_failure(&mut self) {
        self.stats.spawn_failures += 1;
    }

    #[inline]
    pub fn contains(&self, pid: ProcessId) -> bool {
        self.alive.contains_key(&pid)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.alive.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }

    /// Configured pool size.
    #[inline]
    pub fn target(&self) -> usize {
        self.target
    }

    /// How many workers the pool is short of its target.
    #[inline]
    pub fn deficit(&self) -> usize {
        self.target.saturating_sub(self.alive.len())
    }

    /// Snapshot of live pids, in no particular order.
    pub fn pids(&self) -> Vec<ProcessId> {
        self.alive.keys().copied().collect()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

/// Decide how many workers replace one that just exited.
///
/// A report from the worker is authoritative. A worker that vanished
/// without reporting (crash, external kill) is replaced once.
pub fn resolve_replacements(report: Option<u32>, termination: &Termination) -> u32 {
    match report {
        Some(n) => n,
        None => {
            tracing::debug!(%termination, "No exit report; replacing worker once");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let mut set = WorkerSet::new(2);
        assert_eq!(set.deficit(), 2);

        let serial_a = set.insert(100).serial;
        let serial_b = set.insert(101).serial;
        assert_ne!(serial_a, serial_b);
        assert_eq!(set.len(), 2);
        assert_eq!(set.deficit(), 0);
        assert!(set.contains(100));

        let rec = set.remove(100).unwrap();
        assert_eq!(rec.pid, 100);
        assert!(!set.contains(100));
        assert_eq!(set.deficit(), 1);

        let stats = set.stats();
        assert_eq!(stats.spawned, 2);
        assert_eq!(stats.reaped, 1);
    }

    #[test]
    fn test_unrecognized_remove() {
        let mut set = WorkerSet::new(1);
        set.insert(7);
        assert!(set.remove(8).is_none());
        assert_eq!(set.len(), 1);
        assert_eq!(set.stats().unrecognized_exits, 1);
        assert_eq!(set.stats().reaped, 0);
    }

    #[test]
    fn test_resolve_replacements() {
        let crash = Termination::Signaled { signal: 11, core_dumped: true };
        assert_eq!(resolve_replacements(Some(0), &Termination::Exited(0)), 0);
        assert_eq!(resolve_replacements(Some(3), &Termination::Exited(0)), 3);
        assert_eq!(resolve_replacements(None, &crash), 1);
        assert_eq!(resolve_replacements(None, &Termination::Exited(0)), 1);
    }
}
