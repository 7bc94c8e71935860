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

//! A single-flight, bounded-TTL memoizer for expensive upstream calls.
//!
//! When the local mirror cannot answer (the caller asked for secrets, or the watch is down), a
//! burst of identical upstream calls collapses into one: the first caller runs the loader,
//! peers wait on a oneshot, and the result is reused until its TTL lapses. The enclosing cache
//! swaps the whole memoizer on generation change, so entries never outlive a generation.

use std::{
    any::Any,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::RandomState;
use annex_common::{
    clock::SharedClock,
    error::{Error, Result},
};
use hashbrown::{hash_map::Entry, HashMap};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::types::{short_type_name, CertAuthId, CertAuthType};

/// The fingerprint of a memoizable upstream call. Hashable by value, no pointers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FnCacheKey {
    /// A point read of one certificate authority.
    CertAuthority(CertAuthId),
    /// A bulk read of all authorities of one type.
    CertAuthorities(CertAuthType),
}

type Value = Arc<dyn Any + Send + Sync>;
type Waiter = oneshot::Sender<Result<Value>>;

enum Slot {
    Pending { id: u64, waiters: Vec<Waiter> },
    Ready { value: Value, expires_at: Instant },
}

struct Entries {
    map: HashMap<FnCacheKey, Slot, RandomState>,
    next_id: u64,
}

/// The memoizer. See the module docs.
pub struct FnCache {
    ttl: Duration,
    clock: SharedClock,
    entries: Mutex<Entries>,
}

enum Action {
    Hit(Value),
    Wait(oneshot::Receiver<Result<Value>>),
    Load(u64),
}

impl FnCache {
    /// A memoizer whose entries live for `ttl`.
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(Entries {
                map: HashMap::default(),
                next_id: 0,
            }),
        }
    }

    /// Return the memoized value for `key`, or run `loader` to produce it.
    ///
    /// Exactly one concurrent caller per key runs the loader; the rest receive its result.
    /// Errors are returned to every waiting caller but never cached.
    pub async fn get<T, F, Fut>(&self, key: FnCacheKey, loader: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.get_with_ttl(key, None, loader).await
    }

    /// Like [`FnCache::get`], with a per-call TTL. The effective TTL is the smaller of the
    /// cache-level TTL and the override.
    pub async fn get_with_ttl<T, F, Fut>(
        &self,
        key: FnCacheKey,
        ttl_override: Option<Duration>,
        loader: F,
    ) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ttl = ttl_override.map_or(self.ttl, |o| o.min(self.ttl));
        let mut loader = Some(loader);

        loop {
            let action = {
                let mut entries = self.entries.lock();
                let now = self.clock.now();
                let Entries { map, next_id } = &mut *entries;
                match map.entry(key.clone()) {
                    Entry::Occupied(mut o) => match o.get_mut() {
                        Slot::Ready { value, expires_at } if *expires_at > now => {
                            Action::Hit(value.clone())
                        }
                        Slot::Pending { waiters, .. } => {
                            let (tx, rx) = oneshot::channel();
                            waiters.push(tx);
                            Action::Wait(rx)
                        }
                        slot => {
                            let id = *next_id;
                            *next_id += 1;
                            *slot = Slot::Pending { id, waiters: Vec::new() };
                            Action::Load(id)
                        }
                    },
                    Entry::Vacant(v) => {
                        let id = *next_id;
                        *next_id += 1;
                        v.insert(Slot::Pending { id, waiters: Vec::new() });
                        Action::Load(id)
                    }
                }
            };

            match action {
                Action::Hit(value) => return downcast::<T>(value),
                Action::Wait(rx) => match rx.await {
                    Ok(Ok(value)) => return downcast::<T>(value),
                    Ok(Err(e)) => return Err(e),
                    // The loading caller was dropped mid-flight; race for the slot again.
                    Err(_) => continue,
                },
                Action::Load(id) => {
                    let mut pending = PendingGuard {
                        cache: self,
                        key: &key,
                        id,
                        armed: true,
                    };
                    let loader = loader.take().expect("the loader runs at most once");
                    let result = loader().await.map(Arc::new);

                    let shared: Result<Value> = match &result {
                        Ok(value) => Ok(value.clone()),
                        Err(e) => Err(e.clone()),
                    };
                    let waiters = pending.install(&shared, ttl);
                    for waiter in waiters {
                        let _ = waiter.send(shared.clone());
                    }
                    return result;
                }
            }
        }
    }
}

struct PendingGuard<'a> {
    cache: &'a FnCache,
    key: &'a FnCacheKey,
    id: u64,
    armed: bool,
}

impl PendingGuard<'_> {
    fn slot_is_ours(&self, slot: Option<&Slot>) -> bool {
        matches!(slot, Some(Slot::Pending { id, .. }) if *id == self.id)
    }

    // Install the outcome and collect the waiters to notify. A lost race (the slot was
    // superseded while loading) notifies nobody.
    fn install(&mut self, result: &Result<Value>, ttl: Duration) -> Vec<Waiter> {
        self.armed = false;
        let mut entries = self.cache.entries.lock();
        if !self.slot_is_ours(entries.map.get(self.key)) {
            return Vec::new();
        }

        let expires_at = self.cache.clock.now() + ttl;
        let prev = match result {
            Ok(value) => entries.map.insert(
                self.key.clone(),
                Slot::Ready {
                    value: value.clone(),
                    expires_at,
                },
            ),
            Err(_) => entries.map.remove(self.key),
        };
        match prev {
            Some(Slot::Pending { waiters, .. }) => waiters,
            _ => Vec::new(),
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut entries = self.cache.entries.lock();
        if self.slot_is_ours(entries.map.get(self.key)) {
            entries.map.remove(self.key);
        }
    }
}

fn downcast<T>(value: Value) -> Result<Arc<T>>
where
    T: Any + Send + Sync,
{
    value.downcast::<T>().map_err(|_| {
        Error::bad_input(format!(
            "unexpected memoized value type (expected {})",
            short_type_name::<T>()
        ))
    })
}
