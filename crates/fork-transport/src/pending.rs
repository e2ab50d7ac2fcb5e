//! Correlation table for in-flight requests, keyed by wire identifier.

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{ForkError, ForkResult};

/// The value that settles a pending call.
pub(crate) type Settlement = ForkResult<Value>;

/// Maps each outbound wire identifier to the pending call awaiting its
/// response.
///
/// Entries are inserted at send time and removed exactly once: on the
/// matching response, on an explicit [`forget`](Self::forget) (send failure
/// or timeout), or when [`reject_all`](Self::reject_all) drains the table on
/// teardown. Identifiers are allocated monotonically by the handler, so an
/// identifier is never registered twice.
#[derive(Default)]
pub(crate) struct InFlightTable {
    entries: scc::HashMap<u64, oneshot::Sender<Settlement>>,
}

impl InFlightTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a new in-flight entry.
    ///
    /// Returns the receiver that resolves when the entry is settled.
    pub(crate) fn register(&self, id: u64) -> oneshot::Receiver<Settlement> {
        let (tx, rx) = oneshot::channel();
        let inserted = self.entries.insert_sync(id, tx).is_ok();
        debug_assert!(inserted, "wire id {id} already in flight");
        rx
    }

    /// Settle the entry for `id` with the given outcome.
    ///
    /// Returns `false` if no entry matched, which is how unexpected,
    /// duplicate, and late frames are detected.
    pub(crate) fn settle(&self, id: u64, outcome: Settlement) -> bool {
        match self.entries.remove_sync(&id) {
            Some((_, tx)) => {
                // The caller may have gone away; settling is still complete.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove an entry without settling it.
    pub(crate) fn forget(&self, id: u64) -> bool {
        self.entries.remove_sync(&id).is_some()
    }

    /// Drain every entry, rejecting each pending call with `error`.
    pub(crate) fn reject_all(&self, error: ForkError) {
        let mut ids = Vec::new();
        self.entries.retain_sync(|id, _| {
            ids.push(*id);
            true
        });

        for id in ids {
            if let Some((_, tx)) = self.entries.remove_sync(&id) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    /// Number of requests currently awaiting a response.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
