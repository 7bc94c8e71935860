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

//! The cache: construction, lifecycle, and the state shared with the watch engine.
//!
//! The typed per-kind read methods live next to their collections in `users`,
//! `cert_authority`, and `static_tokens`.

use std::{sync::Arc, time::Duration};

use annex_common::{
    backoff::ExponentialBackoff,
    clock::{SharedClock, SystemClock},
    error::{Error, Result},
};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};

use crate::{
    backend::{ClusterConfig, Events, Trust, Users},
    collection::{setup_collections, Collections},
    engine::{Engine, EngineState},
    fncache::FnCache,
    metrics::Metrics,
    types::WatchKind,
};

/// Default TTL for memoized upstream reads.
pub const DEFAULT_FN_CACHE_TTL: Duration = Duration::from_secs(1);

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(200);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Everything the facade, the read guards, and the watch engine share.
pub(crate) struct Shared {
    pub(crate) state: RwLock<EngineState>,
    pub(crate) collections: Collections,
    pub(crate) fn_cache: ArcSwap<FnCache>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) events: Arc<dyn Events>,
    pub(crate) clock: SharedClock,
    pub(crate) fn_cache_ttl: Duration,
    pub(crate) ready: watch::Sender<(u64, bool)>,
}

/// Cache construction parameters. Most callers go through [`CacheBuilder`].
pub struct Config {
    /// The event source the watch engine subscribes to.
    pub events: Arc<dyn Events>,
    /// Cluster configuration reads; required when watching static tokens.
    pub cluster_config: Option<Arc<dyn ClusterConfig>>,
    /// Certificate authority reads; required when watching authorities.
    pub trust: Option<Arc<dyn Trust>>,
    /// User reads; required when watching users.
    pub users: Option<Arc<dyn Users>>,
    /// The kinds this cache mirrors.
    pub watches: Vec<WatchKind>,
    /// TTL for memoized upstream reads.
    pub fn_cache_ttl: Duration,
    /// The time source. Tests inject a manual clock.
    pub clock: SharedClock,
    /// First reconnect delay after a watch failure.
    pub backoff_base: Duration,
    /// Reconnect delay ceiling.
    pub backoff_max: Duration,
}

/// Builds a [`Cache`].
pub struct CacheBuilder {
    events: Option<Arc<dyn Events>>,
    cluster_config: Option<Arc<dyn ClusterConfig>>,
    trust: Option<Arc<dyn Trust>>,
    users: Option<Arc<dyn Users>>,
    watches: Vec<WatchKind>,
    fn_cache_ttl: Duration,
    clock: SharedClock,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBuilder {
    /// A builder with defaults: system clock, default TTL and backoff, no services, no watches.
    pub fn new() -> Self {
        Self {
            events: None,
            cluster_config: None,
            trust: None,
            users: None,
            watches: Vec::new(),
            fn_cache_ttl: DEFAULT_FN_CACHE_TTL,
            clock: Arc::new(SystemClock),
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }

    /// Use one object as the event source and every upstream service.
    pub fn with_backend<B>(self, backend: Arc<B>) -> Self
    where
        B: Events + ClusterConfig + Trust + Users,
    {
        self.with_events(backend.clone())
            .with_cluster_config(backend.clone())
            .with_trust(backend.clone())
            .with_users(backend)
    }

    /// Set the event source.
    pub fn with_events(mut self, events: Arc<dyn Events>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the cluster configuration service.
    pub fn with_cluster_config(mut self, cluster_config: Arc<dyn ClusterConfig>) -> Self {
        self.cluster_config = Some(cluster_config);
        self
    }

    /// Set the certificate authority service.
    pub fn with_trust(mut self, trust: Arc<dyn Trust>) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Set the user service.
    pub fn with_users(mut self, users: Arc<dyn Users>) -> Self {
        self.users = Some(users);
        self
    }

    /// Add one watch.
    pub fn watch(mut self, watch: WatchKind) -> Self {
        self.watches.push(watch);
        self
    }

    /// Replace the watch set.
    pub fn with_watches(mut self, watches: Vec<WatchKind>) -> Self {
        self.watches = watches;
        self
    }

    /// Set the memoizer TTL.
    pub fn with_fn_cache_ttl(mut self, ttl: Duration) -> Self {
        self.fn_cache_ttl = ttl;
        self
    }

    /// Inject a time source.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Override the reconnect backoff window.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Construct and start the cache. Must run inside a tokio runtime.
    pub fn build(self) -> Result<Cache> {
        Cache::new(Config {
            events: self
                .events
                .ok_or_else(|| Error::bad_input("missing parameter Events"))?,
            cluster_config: self.cluster_config,
            trust: self.trust,
            users: self.users,
            watches: self.watches,
            fn_cache_ttl: self.fn_cache_ttl,
            clock: self.clock,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
        })
    }
}

/// A typed, watch-driven mirror of an authoritative backend.
///
/// All mutable state is owned by the instance; nothing is process-global. Dropping the cache
/// aborts the watch engine; [`Cache::close`] shuts it down gracefully.
pub struct Cache {
    pub(crate) shared: Arc<Shared>,
    stop: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    /// A fresh builder.
    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }

    /// Construct and start the cache. Must run inside a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let collections = setup_collections(&config, &config.watches)?;
        let (ready, _) = watch::channel((0u64, false));

        let shared = Arc::new(Shared {
            state: RwLock::new(EngineState::new()),
            collections,
            fn_cache: ArcSwap::from_pointee(FnCache::new(config.fn_cache_ttl, config.clock.clone())),
            metrics: Arc::new(Metrics::default()),
            events: config.events,
            clock: config.clock,
            fn_cache_ttl: config.fn_cache_ttl,
            ready,
        });

        let (stop, stop_rx) = broadcast::channel(1);
        let engine = Engine::new(
            shared.clone(),
            ExponentialBackoff::new(config.backoff_base, config.backoff_max),
        );
        let task = tokio::spawn(engine.run(stop_rx));

        Ok(Self {
            shared,
            stop,
            task: Mutex::new(Some(task)),
        })
    }

    /// The current generation. Zero until the first snapshot is installed.
    pub fn generation(&self) -> u64 {
        self.shared.state.read().generation
    }

    /// The cache's activity counters.
    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }

    /// Wait until the cache serves local reads.
    pub async fn wait_ready(&self) {
        self.wait_for_generation(1).await
    }

    /// Wait until generation `generation` (or later) is installed and serving.
    pub async fn wait_for_generation(&self, generation: u64) {
        let mut rx = self.shared.ready.subscribe();
        loop {
            {
                let (current, serving) = *rx.borrow_and_update();
                if serving && current >= generation {
                    return;
                }
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Shut down: unsubscribe, drain the in-flight apply, and leave all reads falling through
    /// to the upstream. Idempotent.
    pub async fn close(&self) {
        let _ = self.stop.send(());
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
