//! Prefix-searchable set of identifiers and aliases.
//!
//! The registry only relies on the [`Autocomplete`] contract; [`PrefixIndex`]
//! is the in-process implementation used by default.

use std::collections::BTreeSet;

use parking_lot::RwLock;

/// Add/remove/lookup contract the registry keeps in lockstep with its ids
/// and aliases.
pub trait Autocomplete: Send + Sync {
    fn add(&self, entry: &str);
    fn remove(&self, entry: &str);
    /// Entries starting with `prefix`, sorted.
    fn complete(&self, prefix: &str) -> Vec<String>;
}

#[derive(Debug, Default)]
pub struct PrefixIndex {
    entries: RwLock<BTreeSet<String>>,
}

impl PrefixIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries.read().contains(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy of every entry.
    pub fn entries(&self) -> Vec<String> {
        self.entries.read().iter().cloned().collect()
    }
}

impl Autocomplete for PrefixIndex {
    fn add(&self, entry: &str) {
        self.entries.write().insert(entry.to_string());
    }

    fn remove(&self, entry: &str) {
        self.entries.write().remove(entry);
    }

    fn complete(&self, prefix: &str) -> Vec<String> {
        let entries = self.entries.read();
        entries
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(|entry| entry.starts_with(prefix))
            .cloned()
            .collect()
    }
}
