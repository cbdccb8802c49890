//! Last-Writer-Wins Element Set
//!
//! Conflict register used to merge concurrent create/update/delete operations
//! on keyed entities. Each element keeps the winning add entry and the winning
//! remove entry; ordering is the total order `(timestamp, origin_id)`, so equal
//! timestamps are settled by the lexicographically greater origin id.
//!
//! An element is present when it has an add entry that beats its remove entry
//! (or has no remove entry). An add and a remove carrying the exact same
//! `(timestamp, origin_id)` resolve to absent.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Stamp attached to every add/remove entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub timestamp: i64,
    pub origin_id: String,
}

impl Stamp {
    pub fn new(timestamp: i64, origin_id: impl Into<String>) -> Self {
        Self {
            timestamp,
            origin_id: origin_id.into(),
        }
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.origin_id.cmp(&other.origin_id))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddEntry<T> {
    pub value: T,
    pub stamp: Stamp,
}

/// LWW element set keyed by element id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwElementSet<T> {
    adds: BTreeMap<String, AddEntry<T>>,
    removes: BTreeMap<String, Stamp>,
}

impl<T> Default for LwwElementSet<T> {
    fn default() -> Self {
        Self {
            adds: BTreeMap::new(),
            removes: BTreeMap::new(),
        }
    }
}

impl<T: Clone + Ord> LwwElementSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an add; kept only if it beats the current add entry
    ///
    /// Returns true when the entry was taken.
    pub fn add(
        &mut self,
        element_id: impl Into<String>,
        value: T,
        timestamp: i64,
        origin_id: impl Into<String>,
    ) -> bool {
        let entry = AddEntry {
            value,
            stamp: Stamp::new(timestamp, origin_id),
        };
        Self::keep_add(&mut self.adds, element_id.into(), entry)
    }

    /// Record a remove; kept only if it beats the current remove entry
    pub fn remove(
        &mut self,
        element_id: impl Into<String>,
        timestamp: i64,
        origin_id: impl Into<String>,
    ) -> bool {
        Self::keep_remove(&mut self.removes, element_id.into(), Stamp::new(timestamp, origin_id))
    }

    pub fn has(&self, element_id: &str) -> bool {
        self.get(element_id).is_some()
    }

    pub fn get(&self, element_id: &str) -> Option<&T> {
        let add = self.adds.get(element_id)?;
        match self.removes.get(element_id) {
            Some(removed) if add.stamp <= *removed => None,
            _ => Some(&add.value),
        }
    }

    /// Present elements in element-id order
    pub fn values(&self) -> Vec<(&str, &T)> {
        self.adds
            .keys()
            .filter_map(|id| self.get(id).map(|value| (id.as_str(), value)))
            .collect()
    }

    /// Number of present elements
    pub fn len(&self) -> usize {
        self.adds.keys().filter(|id| self.has(id)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge another set into this one
    ///
    /// Commutative, associative and idempotent: each map keeps the entry with the
    /// greater stamp per element. Equal stamps with different values (which only
    /// happens when one origin reuses a timestamp) fall back to value order so the
    /// outcome does not depend on merge direction.
    pub fn merge(&mut self, other: &Self) {
        for (id, entry) in &other.adds {
            Self::keep_add(&mut self.adds, id.clone(), entry.clone());
        }
        for (id, stamp) in &other.removes {
            Self::keep_remove(&mut self.removes, id.clone(), stamp.clone());
        }
    }

    fn keep_add(adds: &mut BTreeMap<String, AddEntry<T>>, id: String, entry: AddEntry<T>) -> bool {
        match adds.get(&id) {
            Some(current)
                if (&current.stamp, &current.value) >= (&entry.stamp, &entry.value) =>
            {
                false
            }
            _ => {
                adds.insert(id, entry);
                true
            }
        }
    }

    fn keep_remove(removes: &mut BTreeMap<String, Stamp>, id: String, stamp: Stamp) -> bool {
        match removes.get(&id) {
            Some(current) if *current >= stamp => false,
            _ => {
                removes.insert(id, stamp);
                true
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
