//! Bidirectional many-to-many relation between session ids and aliases.
//!
//! Both directions live in one value and are only ever changed together, so
//! holding a `&mut AliasRelation` (in practice: the registry's write lock)
//! is enough to keep them consistent.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default, Clone)]
pub struct AliasRelation {
    /// id -> aliases, in insertion order.
    by_id: HashMap<String, Vec<String>>,
    /// alias -> ids. Sorted so listings are deterministic.
    by_alias: HashMap<String, BTreeSet<String>>,
}

impl AliasRelation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `alias` with `id`.
    ///
    /// Returns `true` if this created the alias (it had no ids before).
    pub fn insert(&mut self, id: &str, alias: &str) -> bool {
        let aliases = self.by_id.entry(id.to_string()).or_default();
        if !aliases.iter().any(|a| a == alias) {
            aliases.push(alias.to_string());
        }

        let ids = self.by_alias.entry(alias.to_string()).or_default();
        let created = ids.is_empty();
        ids.insert(id.to_string());
        created
    }

    /// Drop `id` from every alias it belongs to.
    ///
    /// Returns the aliases that lost their last id and were deleted. Removing
    /// an unknown id is a no-op returning an empty list.
    pub fn remove_id(&mut self, id: &str) -> Vec<String> {
        let Some(aliases) = self.by_id.remove(id) else {
            return Vec::new();
        };

        let mut orphaned = Vec::new();
        for alias in aliases {
            if let Some(ids) = self.by_alias.get_mut(&alias) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_alias.remove(&alias);
                    orphaned.push(alias);
                }
            }
        }
        orphaned
    }

    pub fn aliases_of(&self, id: &str) -> &[String] {
        self.by_id.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ids referenced by `alias`, in sorted order.
    pub fn ids_for(&self, alias: &str) -> Option<&BTreeSet<String>> {
        self.by_alias.get(alias)
    }

    pub fn contains_alias(&self, alias: &str) -> bool {
        self.by_alias.contains_key(alias)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn alias_count(&self) -> usize {
        self.by_alias.len()
    }

    /// All aliases with at least one id.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.by_alias.keys().map(String::as_str)
    }

    /// Point-in-time copy of the id -> aliases direction.
    pub fn snapshot(&self) -> HashMap<String, Vec<String>> {
        self.by_id.clone()
    }

    /// Remove everything, returning the ids that were present.
    pub fn clear(&mut self) -> Vec<String> {
        self.by_alias.clear();
        self.by_id.drain().map(|(id, _)| id).collect()
    }

    /// Verify that each direction is the exact mirror of the other and that
    /// no alias is kept with an empty id set.
    pub fn is_consistent(&self) -> bool {
        let forward_ok = self.by_id.iter().all(|(id, aliases)| {
            aliases
                .iter()
                .all(|a| self.by_alias.get(a).is_some_and(|ids| ids.contains(id)))
        });
        let backward_ok = self.by_alias.iter().all(|(alias, ids)| {
            !ids.is_empty()
                && ids.iter().all(|id| {
                    self.by_id
                        .get(id)
                        .is_some_and(|aliases| aliases.iter().any(|a| a == alias))
                })
        });
        forward_ok && backward_ok
    }
}
