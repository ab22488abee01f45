//! # Callback Registry
//!
//! The live mapping from continuation id to local continuation, owned by a
//! [`Session`](crate::session::Session).
//!
//! Both directions of traffic touch it: continuations sent with our outbound
//! calls are registered here, and any continuation the peer invokes is looked up
//! here. Ids come from a single counter, so within one session they increase in
//! the order continuations are handed out.
//!
//! ## Invariants
//! - Every id handed out is eventually removed, either by its owner or by
//!   [`CallbackRegistry::clear`] when the connection epoch ends.
//! - Removing an id that is already gone is a no-op.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

use crate::args::Request;

/// A local continuation the peer can invoke.
#[derive(Clone)]
pub struct Callback(Arc<dyn Fn(Request) + Send + Sync>);

impl Callback {
    pub fn new(f: impl Fn(Request) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, request: Request) {
        (self.0)(request)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback")
    }
}

#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: DashMap<u64, Callback>,
    next_id: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a continuation and returns its freshly minted id.
    pub fn register(&self, callback: Callback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.insert(id, callback);
        id
    }

    /// Returns a clone of the continuation so the caller never runs it under a shard lock.
    pub fn get(&self, id: u64) -> Option<Callback> {
        self.callbacks.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: u64) -> bool {
        self.callbacks.remove(&id).is_some()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.callbacks.contains_key(&id)
    }

    pub fn clear(&self) {
        self.callbacks.clear();
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}
