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

//! The watch engine: subscribe, snapshot, apply, serve, recover.
//!
//! One generation is one successful pass through subscribe → snapshot → apply. The snapshot is
//! fetched without holding the writer lock; the apply step installs every collection's contents
//! in one short critical section, bumps the generation, and swaps the memoizer. Any failure
//! clears the stores, pushes readers to the upstream, and reconnects with backoff.

use std::sync::{atomic::Ordering, Arc};

use annex_common::{
    backoff::ExponentialBackoff,
    error::{Error, Result},
};
use tokio::sync::broadcast;

use crate::{
    cache::Shared,
    fncache::FnCache,
    types::{Event, Op, StreamItem, WatchKind},
};

/// Cache-wide engine state, shared with read guards through a reader-writer lock.
pub(crate) struct EngineState {
    pub(crate) generation: u64,
    pub(crate) read_ok: bool,
    pub(crate) closed: bool,
    pub(crate) confirmed: Vec<WatchKind>,
}

impl EngineState {
    pub(crate) fn new() -> Self {
        Self {
            generation: 0,
            read_ok: false,
            closed: false,
            confirmed: Vec::new(),
        }
    }

    /// Whether reads for `watch` may be served locally.
    pub(crate) fn watching(&self, watch: &WatchKind) -> bool {
        self.read_ok && !self.closed && self.confirmed.contains(watch)
    }
}

enum Exit {
    Stopped,
}

pub(crate) struct Engine {
    shared: Arc<Shared>,
    backoff: ExponentialBackoff,
}

impl Engine {
    pub(crate) fn new(shared: Arc<Shared>, backoff: ExponentialBackoff) -> Self {
        Self { shared, backoff }
    }

    /// Run until stopped. Every iteration is one generation attempt.
    pub(crate) async fn run(mut self, mut stop: broadcast::Receiver<()>) {
        loop {
            match self.run_generation(&mut stop).await {
                Ok(Exit::Stopped) => break,
                Err(e) => {
                    tracing::warn!("[watch engine]: generation failed: {e}");
                }
            }

            self.reset().await;

            let delay = self.backoff.next();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.recv() => break,
            }
        }

        self.terminate();
    }

    async fn run_generation(&mut self, stop: &mut broadcast::Receiver<()>) -> Result<Exit> {
        let watches: Vec<WatchKind> = self
            .shared
            .collections
            .by_kind
            .values()
            .map(|handler| handler.watch_kind().clone())
            .collect();

        let mut sub = self.shared.events.watch(watches).await?;

        // Wait for the watch-established marker; reads stay on the upstream until the first
        // generation of this subscription is installed.
        let status = tokio::select! {
            item = sub.recv() => match item? {
                StreamItem::Init(status) => status,
                StreamItem::Event(_) => {
                    return Err(Error::bad_input("received an event before the watch was established"))
                }
            },
            _ = stop.recv() => return Ok(Exit::Stopped),
        };

        // Fetch phase: upstream RPCs happen without blocking readers.
        let mut applies = Vec::with_capacity(self.shared.collections.by_kind.len());
        for handler in self.shared.collections.by_kind.values() {
            let cache_ok = status.kinds.contains(handler.watch_kind());
            if !cache_ok {
                tracing::warn!(
                    "[watch engine]: kind {} was not confirmed by the backend, serving it from the upstream",
                    handler.watch_kind().kind
                );
            }
            applies.push(handler.fetch(cache_ok).await?);
        }

        // Apply phase: one short critical section installs the snapshot atomically with
        // respect to readers.
        let generation = {
            let mut state = self.shared.state.write();
            if state.closed {
                return Ok(Exit::Stopped);
            }
            for apply in applies {
                apply()?;
            }
            state.generation += 1;
            state.read_ok = true;
            state.confirmed = status.kinds.clone();

            self.shared.fn_cache.store(Arc::new(FnCache::new(
                self.shared.fn_cache_ttl,
                self.shared.clock.clone(),
            )));
            self.shared.metrics.generations.fetch_add(1, Ordering::Relaxed);
            let _ = self.shared.ready.send((state.generation, true));
            state.generation
        };

        self.backoff.reset();
        tracing::info!("[watch engine]: generation {generation} installed");

        loop {
            tokio::select! {
                item = sub.recv() => match item? {
                    StreamItem::Init(_) => {
                        return Err(Error::bad_input("unexpected watch re-establishment on an open stream"))
                    }
                    StreamItem::Event(event) => self.dispatch(event),
                },
                _ = stop.recv() => return Ok(Exit::Stopped),
            }
        }
    }

    /// Apply one event to its collection. Events that cannot be applied are logged and
    /// dropped; the stream itself stays healthy.
    fn dispatch(&self, event: Event) {
        let Some(handler) = self.shared.collections.by_kind.get(&event.kind) else {
            tracing::warn!("[watch engine]: dropping event for unknown kind {}", event.kind);
            self.shared.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let op = event.op;
        let kind = event.kind;
        let result = match op {
            Op::Upsert => handler.on_update(event.resource),
            Op::Delete => handler.on_delete(event.resource),
        };

        match result {
            Ok(()) => {
                self.shared.metrics.events_applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!("[watch engine]: dropping {op:?} event for kind {kind}: {e}");
                self.shared.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Pause local reads and clear every store. Runs after any generation failure; the next
    /// successful reinit advances the generation past whatever was lost.
    async fn reset(&self) {
        let mut applies = Vec::with_capacity(self.shared.collections.by_kind.len());
        for handler in self.shared.collections.by_kind.values() {
            match handler.fetch(false).await {
                Ok(apply) => applies.push(apply),
                Err(e) => {
                    tracing::warn!(
                        "[watch engine]: failed to prepare the reset of kind {}: {e}",
                        handler.watch_kind().kind
                    );
                }
            }
        }

        let mut state = self.shared.state.write();
        state.read_ok = false;
        state.confirmed.clear();
        for apply in applies {
            if let Err(e) = apply() {
                tracing::warn!("[watch engine]: reset apply failed: {e}");
            }
        }
        self.shared.metrics.resets.fetch_add(1, Ordering::Relaxed);
        let _ = self.shared.ready.send((state.generation, false));
    }

    fn terminate(&self) {
        let mut state = self.shared.state.write();
        state.closed = true;
        state.read_ok = false;
        let _ = self.shared.ready.send((state.generation, false));
        tracing::debug!("[watch engine]: terminated");
    }
}
