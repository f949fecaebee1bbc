//! Bookkeeping for the supervisor's worker processes.

use std::collections::BTreeMap;

/// OS process id (`pid_t` on every supported Unix).
pub type Pid = i32;

/// A forked worker and the port it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildProcess {
    pub pid: Pid,
    pub port: u16,
}

/// The supervisor's pid → port table.
///
/// An entry is added when a worker is forked and removed when the
/// supervisor reaps it.  The supervisor exits once the table is empty.
#[derive(Debug, Default)]
pub struct ChildTable {
    children: BTreeMap<Pid, u16>,
}

impl ChildTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, child: ChildProcess) {
        self.children.insert(child.pid, child.port);
    }

    /// Removes `pid`, returning the worker if it was tracked.
    pub fn remove(&mut self, pid: Pid) -> Option<ChildProcess> {
        self.children
            .remove(&pid)
            .map(|port| ChildProcess { pid, port })
    }

    pub fn iter(&self) -> impl Iterator<Item = ChildProcess> + '_ {
        self.children
            .iter()
            .map(|(&pid, &port)| ChildProcess { pid, port })
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn clear(&mut self) {
        self.children.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
