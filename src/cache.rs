//! Per-loader memo of key to pending-or-resolved value.

use std::collections::hash_map::{Entry, HashMap};
use std::hash::Hash;

/// A cache entry: either a handle on a batch that hasn't settled yet, or the
/// value it settled with.
#[derive(Debug, Clone)]
pub(crate) enum Cached<Pending, Value> {
    Pending(Pending),
    Resolved(Value),
}

/// There is no eviction: the cache lives exactly as long as its loader, which
/// is expected to be scoped to a single request.
#[derive(Debug)]
pub(crate) struct KeyCache<Key, Pending, Value> {
    entries: HashMap<Key, Cached<Pending, Value>>,
}

impl<Key: Eq + Hash, Pending, Value> KeyCache<Key, Pending, Value> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, key: &Key) -> Option<&Cached<Pending, Value>> {
        self.entries.get(key)
    }

    pub(crate) fn set(&mut self, key: Key, entry: Cached<Pending, Value>) {
        self.entries.insert(key, entry);
    }

    /// Insert `entry` only if `key` has no entry yet. Returns true if it was
    /// inserted.
    pub(crate) fn set_if_absent(&mut self, key: Key, entry: Cached<Pending, Value>) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(..) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Settle a pending entry. `is_ours` identifies the batch doing the
    /// settling; an entry that was cleared, primed, or re-requested in the
    /// meantime is left alone. With `value` of `None` the entry is removed,
    /// so that the next load tries again.
    pub(crate) fn settle(
        &mut self,
        key: Key,
        value: Option<Value>,
        is_ours: impl Fn(&Pending) -> bool,
    ) {
        if let Entry::Occupied(mut entry) = self.entries.entry(key) {
            let ours = matches!(entry.get(), Cached::Pending(pending) if is_ours(pending));
            if ours {
                match value {
                    Some(value) => {
                        entry.insert(Cached::Resolved(value));
                    }
                    None => {
                        entry.remove();
                    }
                }
            }
        }
    }

    pub(crate) fn clear(&mut self, key: &Key) -> bool {
        self.entries.remove(key).is_some()
    }

    pub(crate) fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
