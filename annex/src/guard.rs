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

//! The per-read decision between the local mirror and the upstream.

use std::{future::Future, sync::atomic::Ordering};

use annex_common::error::Result;
use parking_lot::RwLockReadGuard;

use crate::{cache::Shared, collection::Collection, engine::EngineState, types::WatchKind};

/// Decides, per read, whether the local mirror may answer.
///
/// While held in the read-cache state, the guard shares the engine's state lock, so a reinit
/// cannot clear or replace store contents under the reader. Guards must not be held across
/// upstream I/O.
pub(crate) struct ReadGuard<'a> {
    _state: RwLockReadGuard<'a, EngineState>,
    read_cache: bool,
    generation: u64,
}

impl ReadGuard<'_> {
    /// Whether the mirror may answer this read.
    pub(crate) fn read_cache(&self) -> bool {
        self.read_cache
    }

    /// The generation pinned by this guard.
    #[allow(dead_code)]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

/// Acquire the read-side decision for `watch`.
///
/// The mirror answers only while the engine is serving and the backend confirmed this exact
/// watch; in every other state (initializing, recovering, closed) the caller falls through to
/// the upstream.
pub(crate) fn acquire_read_guard<'a>(shared: &'a Shared, watch: &WatchKind) -> ReadGuard<'a> {
    let state = shared.state.read();
    let read_cache = state.watching(watch);

    if read_cache {
        shared.metrics.reads_local.fetch_add(1, Ordering::Relaxed);
    } else {
        shared.metrics.reads_upstream.fetch_add(1, Ordering::Relaxed);
    }

    ReadGuard {
        generation: state.generation,
        _state: state,
        read_cache,
    }
}

/// The uniform read path: serve from the store under the guard, or fall through to the
/// upstream with the guard released.
///
/// `from_upstream` is constructed by the caller but only polled on fallback.
pub(crate) async fn read_cached_resource<T, S, U, R, CF, UFut>(
    shared: &Shared,
    collection: &Collection<T, S, U>,
    from_store: CF,
    from_upstream: UFut,
) -> Result<R>
where
    CF: FnOnce(&S) -> Result<R>,
    UFut: Future<Output = Result<R>>,
{
    {
        let guard = acquire_read_guard(shared, &collection.watch);
        if guard.read_cache() {
            return from_store(&collection.store);
        }
    }

    from_upstream.await
}
