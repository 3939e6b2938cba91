use std::collections::HashMap;
use std::sync::Arc;

use nostr_sdk::Filter;
use parking_lot::RwLock;

use crate::models::{Identity, PushToken};

/// Current filters per identity
pub type FilterRegistry = Registry<Filter>;

/// Current push tokens per identity
pub type PushRegistry = Registry<PushToken>;

/// Identity-keyed collection store with replace-on-update semantics.
///
/// Each identity maps to one immutable slice. A `put` swaps the slice in a
/// single assignment under the write lock, so readers see either the old or
/// the new collection, never a mix.
pub struct Registry<T> {
    entries: RwLock<HashMap<Identity, Arc<[T]>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the collection for `identity`.
    /// Returns true if the identity already had an entry.
    pub fn put(&self, identity: Identity, items: Vec<T>) -> bool {
        let items: Arc<[T]> = Arc::from(items);
        self.entries.write().insert(identity, items).is_some()
    }

    /// Current collection for `identity`; empty when unknown.
    pub fn get(&self, identity: &Identity) -> Arc<[T]> {
        self.entries
            .read()
            .get(identity)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Every `(owner, item)` pair. Order across identities is unspecified;
    /// order within one identity's collection is preserved.
    pub fn get_all(&self) -> Vec<(Identity, T)> {
        self.snapshot()
            .into_iter()
            .flat_map(|(identity, items)| {
                items
                    .iter()
                    .cloned()
                    .map(|item| (identity.clone(), item))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Consistent per-identity view taken under one read lock.
    pub fn snapshot(&self) -> Vec<(Identity, Arc<[T]>)> {
        self.entries
            .read()
            .iter()
            .map(|(identity, items)| (identity.clone(), Arc::clone(items)))
            .collect()
    }

    /// Number of identities with an entry (including empty ones)
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Total items across all identities
    pub fn item_count(&self) -> usize {
        self.entries.read().values().map(|items| items.len()).sum()
    }
}
