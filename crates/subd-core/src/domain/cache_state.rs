//! ObjectCacheState domain entity
//!
//! The set of object digests present in the local object cache, each with
//! its length in bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::newtypes::Digest;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectCacheState(BTreeMap<Digest, u64>);

impl ObjectCacheState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.0.contains_key(digest)
    }

    pub fn size_of(&self, digest: &Digest) -> Option<u64> {
        self.0.get(digest).copied()
    }

    pub fn insert(&mut self, digest: Digest, size: u64) {
        self.0.insert(digest, size);
    }

    pub fn remove(&mut self, digest: &Digest) -> Option<u64> {
        self.0.remove(digest)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all object sizes
    pub fn total_bytes(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Digest, &u64)> {
        self.0.iter()
    }
}

impl FromIterator<(Digest, u64)> for ObjectCacheState {
    fn from_iter<T: IntoIterator<Item = (Digest, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<Digest, u64>> for ObjectCacheState {
    fn from(map: BTreeMap<Digest, u64>) -> Self {
        Self(map)
    }
}
