//! Request coalescing: at most one wire round-trip per distinct call
//! signature at any time.
//!
//! This is request deduplication, not response caching. Upstream state can
//! change between two calls with the same signature (balance queries being
//! the obvious case), so an entry only lives while its round-trip is
//! unsettled; the next identical call after settlement performs a fresh send.

use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use scc::hash_map::Entry;
use serde_json::Value;
use std::sync::Arc;

use crate::error::ForkResult;

/// The send future registered under a call signature.
pub(crate) type ReplyFuture = BoxFuture<'static, ForkResult<Value>>;

/// A cloneable handle to an in-flight round-trip; every coalesced caller
/// awaits a clone of the same shared future.
pub(crate) type SharedReply = Shared<ReplyFuture>;

/// Keyed store of in-flight round-trips. Cloning shares the store.
#[derive(Clone, Default)]
pub(crate) struct RequestCoalescer {
    entries: Arc<scc::HashMap<String, SharedReply>>,
}

impl RequestCoalescer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight round-trip for `key`, or start one via `make`.
    ///
    /// `make` is invoked only when no unsettled entry exists for `key`. An
    /// entry whose future has already settled is replaced rather than reused,
    /// so a settled result is never served to a later call.
    ///
    /// Every started round-trip gets a watcher task that drives the shared
    /// future to completion and unregisters the key once it settles. The
    /// watcher covers every exit path, including `make` futures that fail
    /// immediately and callers that are cancelled mid-await, so a signature
    /// can never stay occupied by a finished call.
    pub(crate) fn join<F>(&self, key: String, make: F) -> SharedReply
    where
        F: FnOnce() -> ReplyFuture,
    {
        match self.entries.entry_sync(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().peek().is_none() {
                    return occupied.get().clone();
                }
                // Settled but not yet swept by its watcher.
                let shared = make().shared();
                *occupied.get_mut() = shared.clone();
                self.watch_for_settlement(key, shared.clone());
                shared
            }
            Entry::Vacant(vacant) => {
                let shared = make().shared();
                vacant.insert_entry(shared.clone());
                self.watch_for_settlement(key, shared.clone());
                shared
            }
        }
    }

    fn watch_for_settlement(&self, key: String, shared: SharedReply) {
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            let _ = shared.clone().await;
            // Only remove the entry this watcher was armed for; the key may
            // already hold a replacement round-trip.
            entries.remove_if_sync(&key, |current| current.ptr_eq(&shared));
        });
    }

    /// Number of signatures with an in-flight round-trip.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
