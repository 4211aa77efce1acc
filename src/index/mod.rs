//! Zone index: the field-hints index (FHI)
//!
//! Maps trigram fingerprints to the leaves that hold at least one field
//! value containing that trigram:
//!
//! ```text
//!   fp("Job") → {leaf_1, leaf_3}
//!   fp("ob-") → {leaf_1}
//!   query {fp("Job"), fp("ob-")} → {leaf_1} ∩ {leaf_1, leaf_3} = {leaf_1}
//! ```
//!
//! False positives are fine (the leaf filters exactly); false negatives
//! are not. Posting lists only grow until a leaf is forgotten.

pub mod fhi;

pub use fhi::{FieldHintsIndex, IndexStats};

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::trigram::Fingerprint;
use crate::types::LeafId;

/// Fingerprint to leaves, as sent by leaves in one batch
pub type HintBatch = BTreeMap<Fingerprint, BTreeSet<LeafId>>;

/// Body of `forgetLeaf` and `deregisterLeaf` calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgetLeaf {
    pub leaf_id: LeafId,
}

/// Anything that can answer field-hints calls
#[async_trait]
pub trait HintsIndex: Send + Sync {
    /// Union-merge a batch into the posting lists
    async fn register_hints(&self, hints: HintBatch) -> Result<()>;

    /// Leaves that may hold a value containing every fingerprint; the
    /// empty set of fingerprints means every known leaf
    async fn query_hints(&self, fingerprints: &BTreeSet<Fingerprint>) -> Result<BTreeSet<LeafId>>;

    /// Drop a departed leaf from every posting list
    async fn forget_leaf(&self, leaf: LeafId) -> Result<()>;
}
