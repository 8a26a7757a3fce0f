//! Append-only, thread-safe failure list shared by mailer workers.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::FailureCause;

/// Cloneable handle to a shared list of permanently failed addresses.
#[derive(Debug, Clone, Default)]
pub struct FailureCollector {
    inner: Arc<Mutex<Vec<(String, FailureCause)>>>,
}

impl FailureCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one failed address.
    pub fn push(&self, address: impl Into<String>, cause: FailureCause) {
        self.inner.lock().push((address.into(), cause));
    }

    /// Records several addresses that failed for the same cause, under a
    /// single lock.
    pub fn extend<I>(&self, addresses: I, cause: FailureCause)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut guard = self.inner.lock();
        guard.extend(addresses.into_iter().map(|a| (a.into(), cause.clone())));
    }

    /// Number of recorded failures.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when nothing failed.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drains the recorded failures in insertion order. An address recorded
    /// more than once keeps its first cause.
    pub fn take(&self) -> Vec<(String, FailureCause)> {
        let failures = std::mem::take(&mut *self.inner.lock());
        let mut seen = HashSet::with_capacity(failures.len());
        failures
            .into_iter()
            .filter(|(address, _)| seen.insert(address.clone()))
            .collect()
    }
}
