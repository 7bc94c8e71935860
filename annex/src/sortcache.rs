// Copyright 2025 annex Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! An ordered container addressable through several named indexes.
//!
//! Every value is bound under every index, so clients pick a lookup shape at read time without
//! the container duplicating entity storage. Writers displace any value they collide with on any
//! index; at most one value is bound per index key.

use std::{collections::BTreeMap, ops::Bound, sync::Arc};

use itertools::Itertools;
use parking_lot::RwLock;

/// A named sort key derivation. Must be total over the value type.
pub type IndexFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

/// Configuration for a [`SortCache`].
pub struct SortCacheConfig<T> {
    /// The named indexes, in declaration order. The first index is the identity index.
    pub indexes: Vec<(&'static str, IndexFn<T>)>,
}

/// An in-memory container ordered under each of several named indexes.
///
/// Interior locking: mutations take the write half of a reader-writer lock, reads take the
/// shared half, so a value is never observed half-indexed.
pub struct SortCache<T> {
    indexes: Vec<(&'static str, IndexFn<T>)>,
    trees: RwLock<Vec<BTreeMap<String, Arc<T>>>>,
}

impl<T> SortCache<T> {
    /// Create an empty cache with the configured indexes.
    ///
    /// # Panics
    ///
    /// Panics if no indexes are declared or an index name repeats.
    pub fn new(config: SortCacheConfig<T>) -> Self {
        assert!(!config.indexes.is_empty(), "sort cache requires at least one index");
        assert!(
            config.indexes.iter().map(|(name, _)| name).all_unique(),
            "sort cache index names must be unique"
        );

        let trees = RwLock::new(config.indexes.iter().map(|_| BTreeMap::new()).collect());
        Self {
            indexes: config.indexes,
            trees,
        }
    }

    fn index_pos(&self, index: &str) -> usize {
        self.indexes
            .iter()
            .position(|(name, _)| *name == index)
            .unwrap_or_else(|| panic!("no such index: {index:?}"))
    }

    /// Insert `value` under every index, displacing any value it collides with.
    pub fn put(&self, value: T) {
        let keys: Vec<String> = self.indexes.iter().map(|(_, f)| f(&value)).collect();
        let value = Arc::new(value);

        let mut trees = self.trees.write();
        for (pos, key) in keys.iter().enumerate() {
            if let Some(existing) = trees[pos].get(key).cloned() {
                self.purge(&mut trees, &existing);
            }
        }
        for (pos, key) in keys.into_iter().enumerate() {
            trees[pos].insert(key, value.clone());
        }
    }

    // Remove every binding of `value`, leaving bindings that point at other values alone.
    fn purge(&self, trees: &mut [BTreeMap<String, Arc<T>>], value: &Arc<T>) {
        for (pos, (_, f)) in self.indexes.iter().enumerate() {
            let key = f(value.as_ref());
            if trees[pos].get(&key).is_some_and(|bound| Arc::ptr_eq(bound, value)) {
                trees[pos].remove(&key);
            }
        }
    }

    /// The value bound to `key` under `index`, if any.
    pub fn get(&self, index: &str, key: &str) -> Option<Arc<T>> {
        let pos = self.index_pos(index);
        self.trees.read()[pos].get(key).cloned()
    }

    /// Remove the value bound to `key` under `index` from all indexes. No-op when unbound.
    pub fn delete(&self, index: &str, key: &str) {
        let pos = self.index_pos(index);
        let mut trees = self.trees.write();
        if let Some(value) = trees[pos].get(key).cloned() {
            self.purge(&mut trees, &value);
        }
    }

    /// Drop all contents.
    pub fn clear(&self) {
        let mut trees = self.trees.write();
        for tree in trees.iter_mut() {
            tree.clear();
        }
    }

    /// The number of distinct values.
    pub fn len(&self) -> usize {
        self.trees.read()[0].len()
    }

    /// Whether the cache holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The values whose `index`-key falls in `[start, stop)`, ascending by key.
    ///
    /// An empty `start` begins at the smallest key; an empty `stop` runs to the end. The
    /// returned sequence is a consistent snapshot taken under the shared lock.
    pub fn ascend(&self, index: &str, start: &str, stop: &str) -> impl Iterator<Item = Arc<T>> {
        let pos = self.index_pos(index);
        let upper = match stop {
            "" => Bound::Unbounded,
            stop => Bound::Excluded(stop),
        };
        self.trees.read()[pos]
            .range::<str, _>((Bound::Included(start), upper))
            .map(|(_, value)| value.clone())
            .collect_vec()
            .into_iter()
    }
}

/// The smallest key ordered strictly after every key starting with `prefix`.
///
/// Returns the empty string (an unbounded stop) when no such key exists. Operates on bytes;
/// index keys are expected to be ASCII.
pub fn next_key(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.last().copied() {
        if last < 0xff {
            *bytes.last_mut().expect("non-empty") = last + 1;
            return String::from_utf8_lossy(&bytes).into_owned();
        }
        bytes.pop();
    }
    String::new()
}
