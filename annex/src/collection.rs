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

//! The per-kind binding of a store, an upstream fetcher, and a watch descriptor, plus the
//! event-dispatch glue between them.

use std::{any::Any, collections::BTreeMap, sync::Arc};

use annex_common::error::{Error, Result};
use async_trait::async_trait;

use crate::{
    cache::Config,
    cert_authority::new_cert_authority_collection,
    static_tokens::new_static_tokens_collection,
    store::Store,
    types::{short_type_name, Kind, Resource, ResourceHeader, WatchKind},
    users::new_user_collection,
};

/// The install half of a reinit: runs inside the writer lock, must not block.
pub type ApplyFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// A kind-erased collection, as seen by the watch engine.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Fetch resources and return a function which will apply them to the store.
    ///
    /// `fetch` must not mutate cache state outside of the apply function. When `cache_ok` is
    /// false this collection is excluded from the generation being prepared: nothing is
    /// fetched, but the returned apply function still clears the store.
    async fn fetch(&self, cache_ok: bool) -> Result<ApplyFn>;

    /// Apply a single upsert event.
    fn on_update(&self, resource: Resource) -> Result<()>;

    /// Apply a single delete event. For singletons this is an alias for clear.
    fn on_delete(&self, resource: Resource) -> Result<()>;

    /// The watch required for this collection.
    fn watch_kind(&self) -> &WatchKind;
}

/// The bulk-snapshot half of an upstream service.
#[async_trait]
pub trait UpstreamFetch<T>: Send + Sync {
    /// Fetch all values of the kind.
    async fn get_all(&self, load_secrets: bool) -> Result<Vec<T>>;
}

/// Builds a kind's value from an identity-only delete event.
pub type HeaderTransform<T> = fn(&ResourceHeader) -> Result<T>;

/// A cached resource kind: its store, its upstream, and its watch descriptor.
pub struct Collection<T, S, U> {
    pub(crate) store: Arc<S>,
    pub(crate) upstream: U,
    pub(crate) watch: WatchKind,
    pub(crate) header_transform: Option<HeaderTransform<T>>,
    pub(crate) singleton: bool,
}

fn recover<T>(resource: Resource) -> Result<Option<T>>
where
    T: Any + Send + Sync,
{
    match resource {
        Resource::Native(any) => match any.downcast::<T>() {
            Ok(value) => Ok(Some(*value)),
            Err(_) => Err(Error::bad_input(format!(
                "unexpected resource type (expected {})",
                short_type_name::<T>()
            ))),
        },
        Resource::Wrapped(wrapped) => {
            let wrapped_type = wrapped.wrapped_type();
            match wrapped.unwrap_resource().downcast::<T>() {
                Ok(value) => Ok(Some(*value)),
                Err(_) => Err(Error::bad_input(format!(
                    "unexpected wrapped type {wrapped_type} (expected {})",
                    short_type_name::<T>()
                ))),
            }
        }
        Resource::Header(_) => Ok(None),
    }
}

#[async_trait]
impl<T, S, U> ResourceHandler for Collection<T, S, U>
where
    T: Any + Send + Sync,
    S: Store<T> + 'static,
    U: UpstreamFetch<T>,
{
    async fn fetch(&self, cache_ok: bool) -> Result<ApplyFn> {
        // Singletons only get deleted or updated by a reinit, never both.
        let mut delete_singleton = false;

        let mut resources = Vec::new();
        if cache_ok {
            match self.upstream.get_all(self.watch.load_secrets).await {
                Ok(all) => resources = all,
                Err(e) if e.is_not_found() => delete_singleton = true,
                Err(e) => return Err(e),
            }
        }

        let store = self.store.clone();
        let singleton = self.singleton;
        Ok(Box::new(move || {
            // Always clear if this is not a singleton; otherwise only clear when the
            // singleton was absent upstream or the kind is excluded from this generation.
            if !singleton || delete_singleton || !cache_ok {
                if let Err(e) = store.clear() {
                    if !e.is_not_found() {
                        return Err(e);
                    }
                }
            }
            if (singleton && delete_singleton) || !cache_ok {
                return Ok(());
            }
            for resource in resources {
                store.put(resource)?;
            }
            Ok(())
        }))
    }

    fn on_update(&self, resource: Resource) -> Result<()> {
        match recover::<T>(resource)? {
            Some(value) => self.store.put(value),
            None => Err(Error::bad_input(format!(
                "unexpected resource header on update (expected {})",
                short_type_name::<T>()
            ))),
        }
    }

    fn on_delete(&self, resource: Resource) -> Result<()> {
        let value = match resource {
            Resource::Header(header) => match self.header_transform {
                Some(transform) => transform(&header)?,
                None => {
                    return Err(Error::bad_input(format!(
                        "unable to convert resource header to {} (no transform specified, this is a bug)",
                        short_type_name::<T>()
                    )))
                }
            },
            carrier => match recover::<T>(carrier)? {
                Some(value) => value,
                None => unreachable!("headers are handled above"),
            },
        };
        self.store.delete(&value)
    }

    fn watch_kind(&self) -> &WatchKind {
        &self.watch
    }
}

/// The per-kind collections a cache instance tracks: a kind-erased registry for the watch
/// engine and typed handles for the facade.
pub(crate) struct Collections {
    pub(crate) by_kind: BTreeMap<Kind, Arc<dyn ResourceHandler>>,

    pub(crate) static_tokens: Option<Arc<crate::static_tokens::StaticTokensCollection>>,
    pub(crate) cert_authorities: Option<Arc<crate::cert_authority::CertAuthorityCollection>>,
    pub(crate) users: Option<Arc<crate::users::UserCollection>>,
}

pub(crate) fn setup_collections(config: &Config, watches: &[WatchKind]) -> Result<Collections> {
    let mut out = Collections {
        by_kind: BTreeMap::new(),
        static_tokens: None,
        cert_authorities: None,
        users: None,
    };

    for watch in watches {
        match watch.kind {
            Kind::StaticTokens => {
                let cluster_config = config
                    .cluster_config
                    .clone()
                    .ok_or_else(|| Error::bad_input("missing parameter ClusterConfig"))?;
                let collection = Arc::new(new_static_tokens_collection(cluster_config, watch.clone()));
                out.by_kind.insert(watch.kind, collection.clone());
                out.static_tokens = Some(collection);
            }
            Kind::CertAuthority => {
                let trust = config
                    .trust
                    .clone()
                    .ok_or_else(|| Error::bad_input("missing parameter Trust"))?;
                let collection = Arc::new(new_cert_authority_collection(trust, watch.clone()));
                out.by_kind.insert(watch.kind, collection.clone());
                out.cert_authorities = Some(collection);
            }
            Kind::User => {
                let users = config
                    .users
                    .clone()
                    .ok_or_else(|| Error::bad_input("missing parameter Users"))?;
                let collection = Arc::new(new_user_collection(users, watch.clone()));
                out.by_kind.insert(watch.kind, collection.clone());
                out.users = Some(collection);
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        store::{ResourceStore, SingletonStore},
        types::{StaticTokens, User},
    };

    struct StubUpstream<T> {
        result: Mutex<Option<Result<Vec<T>>>>,
    }

    impl<T> StubUpstream<T> {
        fn new(result: Result<Vec<T>>) -> Self {
            Self {
                result: Mutex::new(Some(result)),
            }
        }
    }

    #[async_trait]
    impl<T> UpstreamFetch<T> for StubUpstream<T>
    where
        T: Send + Sync,
    {
        async fn get_all(&self, _load_secrets: bool) -> Result<Vec<T>> {
            self.result.lock().take().expect("get_all called once")
        }
    }

    fn user_collection(
        upstream: StubUpstream<User>,
    ) -> Collection<User, ResourceStore<User>, StubUpstream<User>> {
        Collection {
            store: Arc::new(ResourceStore::new(vec![(
                "name",
                Arc::new(|u: &User| u.name.clone()) as crate::sortcache::IndexFn<User>,
            )])),
            upstream,
            watch: WatchKind::new(Kind::User),
            header_transform: Some(|header| Ok(User::new(header.name.clone()))),
            singleton: false,
        }
    }

    #[test]
    fn test_on_update_recovers_native_and_wrapped() {
        let collection = user_collection(StubUpstream::new(Ok(vec![])));

        collection.on_update(Resource::native(User::new("alice"))).unwrap();
        collection.on_update(Resource::wrapped(User::new("bob"))).unwrap();

        assert_eq!(collection.store.get("name", "alice").unwrap().name, "alice");
        assert_eq!(collection.store.get("name", "bob").unwrap().name, "bob");
    }

    #[test]
    fn test_on_update_rejects_foreign_and_header_carriers() {
        let collection = user_collection(StubUpstream::new(Ok(vec![])));

        let err = collection
            .on_update(Resource::native(StaticTokens::default()))
            .unwrap_err();
        assert!(err.is_bad_input());
        assert!(err.message().contains("expected User"));

        let err = collection
            .on_update(Resource::wrapped(StaticTokens::default()))
            .unwrap_err();
        assert!(err.is_bad_input());
        assert!(err.message().contains("StaticTokens"));

        let err = collection
            .on_update(Resource::header(ResourceHeader::new(Kind::User, "alice")))
            .unwrap_err();
        assert!(err.is_bad_input());
    }

    #[test]
    fn test_on_delete_accepts_headers() {
        let collection = user_collection(StubUpstream::new(Ok(vec![])));
        collection.on_update(Resource::native(User::new("alice"))).unwrap();

        collection
            .on_delete(Resource::header(ResourceHeader::new(Kind::User, "alice")))
            .unwrap();
        assert!(collection.store.get("name", "alice").unwrap_err().is_not_found());
    }

    #[test]
    fn test_on_delete_without_transform_rejects_headers() {
        let mut collection = user_collection(StubUpstream::new(Ok(vec![])));
        collection.header_transform = None;

        let err = collection
            .on_delete(Resource::header(ResourceHeader::new(Kind::User, "alice")))
            .unwrap_err();
        assert!(err.is_bad_input());
        assert!(err.message().contains("no transform specified"));
    }

    #[tokio::test]
    async fn test_fetch_apply_installs_snapshot() {
        let collection = user_collection(StubUpstream::new(Ok(vec![
            User::new("alice"),
            User::new("bob"),
        ])));
        collection.on_update(Resource::native(User::new("stale"))).unwrap();

        let apply = collection.fetch(true).await.unwrap();
        apply().unwrap();

        assert_eq!(collection.store.len(), 2);
        assert!(collection.store.get("name", "stale").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_fetch_with_cache_not_ok_clears_without_fetching() {
        // The stub panics if get_all runs; cache_ok = false must not contact the upstream.
        let collection = user_collection(StubUpstream {
            result: Mutex::new(None),
        });
        collection.on_update(Resource::native(User::new("alice"))).unwrap();

        let apply = collection.fetch(false).await.unwrap();
        apply().unwrap();
        assert_eq!(collection.store.len(), 0);
    }

    #[tokio::test]
    async fn test_fetch_propagates_upstream_errors() {
        let collection = user_collection(StubUpstream::new(Err(Error::unavailable("backend down"))));
        let err = match collection.fetch(true).await {
            Err(e) => e,
            Ok(_) => panic!("expected fetch to fail"),
        };
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_singleton_not_found_deletes_only() {
        let collection = Collection {
            store: Arc::new(SingletonStore::<StaticTokens>::new()),
            upstream: StubUpstream::new(Err(Error::not_found("no static tokens configured"))),
            watch: WatchKind::new(Kind::StaticTokens),
            header_transform: None,
            singleton: true,
        };
        collection.store.put(StaticTokens::default()).unwrap();

        let apply = collection.fetch(true).await.unwrap();
        apply().unwrap();
        assert!(collection.store.get().unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_singleton_found_replaces_without_clearing() {
        let tokens = StaticTokens::default();
        let collection = Collection {
            store: Arc::new(SingletonStore::<StaticTokens>::new()),
            upstream: StubUpstream::new(Ok(vec![tokens.clone()])),
            watch: WatchKind::new(Kind::StaticTokens),
            header_transform: None,
            singleton: true,
        };

        let apply = collection.fetch(true).await.unwrap();
        apply().unwrap();
        assert_eq!(*collection.store.get().unwrap(), tokens);
    }
}
