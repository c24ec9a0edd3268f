use std::fmt;
use std::sync::Arc;

use crate::backend::Backend;

/// Running OS process.
///
/// The handle becomes stale once the process exits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessHandle {
    /// Process ID.
    pid: u64,

    /// Process name.
    name: String,
}

impl ProcessHandle {
    /// Creates a new process handle.
    pub fn new(pid: u64, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
        }
    }

    /// Returns the process ID.
    pub const fn pid(&self) -> u64 {
        self.pid
    }

    /// Returns the process name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Filter selecting candidate processes.
#[derive(Clone)]
pub enum ProcessFilter {
    /// Case-insensitive substring of the process name.
    NameContains(String),

    /// Arbitrary predicate.
    Predicate(Arc<dyn Fn(&ProcessHandle) -> bool + Send + Sync>),
}

impl ProcessFilter {
    /// Creates a filter matching processes whose name contains `needle`,
    /// ignoring case.
    pub fn name_contains(needle: impl AsRef<str>) -> Self {
        Self::NameContains(needle.as_ref().to_lowercase())
    }

    /// Creates a filter from an arbitrary predicate.
    pub fn predicate(f: impl Fn(&ProcessHandle) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    /// Returns whether the process matches this filter.
    pub fn matches(&self, process: &ProcessHandle) -> bool {
        match self {
            Self::NameContains(needle) => process.name.to_lowercase().contains(needle.as_str()),
            Self::Predicate(f) => f(process),
        }
    }
}

impl fmt::Debug for ProcessFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameContains(needle) => f.debug_tuple("NameContains").field(needle).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<&str> for ProcessFilter {
    fn from(needle: &str) -> Self {
        Self::name_contains(needle)
    }
}

impl From<String> for ProcessFilter {
    fn from(needle: String) -> Self {
        Self::name_contains(needle)
    }
}

/// Candidate processes matching a [ProcessFilter], in ascending PID order.
///
/// The filter is applied lazily over a single snapshot of the process
/// table. Call [find_candidates] again for a fresh snapshot.
pub struct Candidates {
    snapshot: std::vec::IntoIter<ProcessHandle>,
    filter: ProcessFilter,
}

impl Iterator for Candidates {
    type Item = ProcessHandle;

    fn next(&mut self) -> Option<Self::Item> {
        let filter = &self.filter;
        self.snapshot.find(|process| filter.matches(process))
    }
}

/// Enumerates the running processes matching the given filter.
///
/// No candidate is not an error: the returned iterator is simply empty.
#[tracing::instrument(name = "FindCandidates", skip_all, fields(filter = ?filter))]
pub async fn find_candidates<B: Backend>(
    backend: &B,
    filter: ProcessFilter,
) -> crate::Result<Candidates> {
    let mut snapshot = backend
        .processes()
        .await
        .map_err(|e| crate::Error::Backend(Box::new(e)))?;

    snapshot.sort_unstable_by_key(ProcessHandle::pid);
    snapshot.dedup_by_key(|process| process.pid);

    tracing::trace!(processes = snapshot.len(), "process table snapshot");

    Ok(Candidates {
        snapshot: snapshot.into_iter(),
        filter,
    })
}
