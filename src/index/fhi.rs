//! In-memory field-hints index

use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};

use super::{HintBatch, HintsIndex};
use crate::error::Result;
use crate::trigram::Fingerprint;
use crate::types::LeafId;

/// Posting lists keyed by fingerprint
///
/// Lock striping comes from `DashMap`: concurrent registrations for
/// different fingerprints never contend.
#[derive(Default)]
pub struct FieldHintsIndex {
    postings: DashMap<Fingerprint, DashSet<LeafId>>,
    /// Every leaf that has ever registered a hint and was not forgotten
    universe: DashSet<LeafId>,
    /// Forgotten leaves; ids are never reused so late hints are dropped
    tombstones: DashSet<LeafId>,
}

/// Index size counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub fingerprints: usize,
    pub postings: usize,
    pub leaves: usize,
    pub forgotten: usize,
}

impl FieldHintsIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hints: &HintBatch) {
        for (&fingerprint, leaves) in hints {
            for &leaf in leaves {
                if self.tombstones.contains(&leaf) {
                    continue;
                }
                self.postings.entry(fingerprint).or_default().insert(leaf);
                self.universe.insert(leaf);
                // forget_leaf may have swept between the check and insert
                if self.tombstones.contains(&leaf) {
                    if let Some(list) = self.postings.get(&fingerprint) {
                        list.remove(&leaf);
                    }
                    self.universe.remove(&leaf);
                }
            }
        }
    }

    /// Intersection of the posting lists of `fingerprints`
    pub fn query(&self, fingerprints: &BTreeSet<Fingerprint>) -> BTreeSet<LeafId> {
        if fingerprints.is_empty() {
            return self.universe.iter().map(|l| *l).collect();
        }

        // A fingerprint nobody advertised means no leaf can match.
        let mut lists = Vec::with_capacity(fingerprints.len());
        for fp in fingerprints {
            match self.postings.get(fp) {
                Some(list) => lists.push(list.iter().map(|l| *l).collect::<BTreeSet<_>>()),
                None => return BTreeSet::new(),
            }
        }
        lists.sort_by_key(BTreeSet::len);

        let mut iter = lists.into_iter();
        let Some(mut result) = iter.next() else {
            return BTreeSet::new();
        };
        for list in iter {
            result.retain(|leaf| list.contains(leaf));
            if result.is_empty() {
                break;
            }
        }
        result
    }

    pub fn forget(&self, leaf: LeafId) {
        self.tombstones.insert(leaf);
        self.universe.remove(&leaf);
        for list in self.postings.iter() {
            list.remove(&leaf);
        }
        self.postings.retain(|_, list| !list.is_empty());
        tracing::info!(leaf = %leaf, "Leaf forgotten by field-hints index");
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            fingerprints: self.postings.len(),
            postings: self.postings.iter().map(|l| l.len()).sum(),
            leaves: self.universe.len(),
            forgotten: self.tombstones.len(),
        }
    }
}

#[async_trait]
impl HintsIndex for FieldHintsIndex {
    async fn register_hints(&self, hints: HintBatch) -> Result<()> {
        self.register(&hints);
        Ok(())
    }

    async fn query_hints(&self, fingerprints: &BTreeSet<Fingerprint>) -> Result<BTreeSet<LeafId>> {
        Ok(self.query(fingerprints))
    }

    async fn forget_leaf(&self, leaf: LeafId) -> Result<()> {
        self.forget(leaf);
        Ok(())
    }
}
