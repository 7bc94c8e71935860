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

//! Store variants backing a collection: a 0-or-1 singleton and an indexed resource set.

use std::sync::Arc;

use annex_common::error::{Error, Result};
use arc_swap::ArcSwapOption;

use crate::{
    sortcache::{IndexFn, SortCache, SortCacheConfig},
    types::short_type_name,
};

/// The write surface shared by the store variants. Reads stay on the concrete types because
/// their shapes differ (a singleton has no index arguments).
pub trait Store<T>: Send + Sync {
    /// Drop all contents.
    fn clear(&self) -> Result<()>;
    /// Admit `value`, replacing whatever it collides with.
    fn put(&self, value: T) -> Result<()>;
    /// Remove `value`. Idempotent.
    fn delete(&self, value: &T) -> Result<()>;
}

/// An admission predicate. Values it rejects are silently dropped on put.
pub type FilterFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Holds zero or one value of `T`.
pub struct SingletonStore<T> {
    value: ArcSwapOption<T>,
}

impl<T> Default for SingletonStore<T>
where
    T: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn opt_ptr<T>(value: &Option<Arc<T>>) -> *const T {
    value.as_ref().map_or(std::ptr::null(), |v| Arc::as_ptr(v))
}

impl<T> SingletonStore<T>
where
    T: Send + Sync + 'static,
{
    /// An empty store.
    pub fn new() -> Self {
        Self {
            value: ArcSwapOption::const_empty(),
        }
    }

    /// The held value.
    pub fn get(&self) -> Result<Arc<T>> {
        self.value.load_full().ok_or_else(|| {
            Error::not_found(format!(
                "no value for singleton of type {}",
                short_type_name::<T>()
            ))
        })
    }
}

impl<T> Store<T> for SingletonStore<T>
where
    T: Send + Sync + 'static,
{
    fn clear(&self) -> Result<()> {
        self.value.store(None);
        Ok(())
    }

    fn put(&self, value: T) -> Result<()> {
        let current = self.value.load_full();
        let prev = self.value.compare_and_swap(&current, Some(Arc::new(value)));
        if opt_ptr(&prev) != opt_ptr(&current) {
            return Err(Error::conflict("concurrent update occurred"));
        }
        Ok(())
    }

    fn delete(&self, _value: &T) -> Result<()> {
        self.clear()
    }
}

/// An indexed set of resources with an optional admission filter.
pub struct ResourceStore<T> {
    filter: Option<FilterFn<T>>,
    indexes: Vec<(&'static str, IndexFn<T>)>,
    cache: SortCache<T>,
}

impl<T> ResourceStore<T>
where
    T: Send + Sync + 'static,
{
    /// A store indexed by `indexes`, admitting everything.
    pub fn new(indexes: Vec<(&'static str, IndexFn<T>)>) -> Self {
        Self::with_filter(None, indexes)
    }

    /// A store indexed by `indexes`, admitting only values `filter` accepts.
    pub fn with_filter(filter: Option<FilterFn<T>>, indexes: Vec<(&'static str, IndexFn<T>)>) -> Self {
        let cache = SortCache::new(SortCacheConfig {
            indexes: indexes.clone(),
        });
        Self {
            filter,
            indexes,
            cache,
        }
    }

    /// The value bound to `key` under `index`.
    pub fn get(&self, index: &str, key: &str) -> Result<Arc<T>> {
        self.cache.get(index, key).ok_or_else(|| {
            Error::not_found(format!("no value for key {key:?} in index {index:?}"))
                .with_context("type", short_type_name::<T>())
        })
    }

    /// The values whose `index`-key falls in `[start, stop)`, ascending.
    pub fn iterate(&self, index: &str, start: &str, stop: &str) -> impl Iterator<Item = Arc<T>> {
        self.cache.ascend(index, start, stop)
    }

    /// The number of stored values.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the store holds no values.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl<T> Store<T> for ResourceStore<T>
where
    T: Send + Sync + 'static,
{
    fn clear(&self) -> Result<()> {
        self.cache.clear();
        Ok(())
    }

    fn put(&self, value: T) -> Result<()> {
        if let Some(filter) = &self.filter {
            if !filter(&value) {
                return Ok(());
            }
        }
        self.cache.put(value);
        Ok(())
    }

    fn delete(&self, value: &T) -> Result<()> {
        for (index, key_fn) in self.indexes.iter() {
            self.cache.delete(index, &key_fn(value));
        }
        Ok(())
    }
}
