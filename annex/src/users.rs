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

use std::sync::Arc;

use annex_common::error::{Error, Result};
use async_trait::async_trait;

use crate::{
    backend::Users,
    cache::Cache,
    collection::{Collection, UpstreamFetch},
    guard::{acquire_read_guard, read_cached_resource},
    sortcache::IndexFn,
    store::ResourceStore,
    types::{ListUsersRequest, ListUsersResponse, User, WatchKind},
};

pub(crate) const DEFAULT_PAGE_SIZE: usize = 200;

pub(crate) type UserCollection = Collection<User, ResourceStore<User>, UserUpstream>;

pub(crate) fn new_user_collection(users: Arc<dyn Users>, watch: WatchKind) -> UserCollection {
    Collection {
        store: Arc::new(ResourceStore::new(vec![(
            "name",
            Arc::new(|user: &User| user.name.clone()) as IndexFn<User>,
        )])),
        upstream: UserUpstream { users },
        watch,
        header_transform: Some(|header| Ok(User::new(header.name.clone()))),
        singleton: false,
    }
}

pub(crate) struct UserUpstream {
    users: Arc<dyn Users>,
}

impl UserUpstream {
    pub(crate) async fn get_user(&self, name: &str, with_secrets: bool) -> Result<User> {
        self.users.get_user(name, with_secrets).await
    }

    pub(crate) async fn get_users(&self, with_secrets: bool) -> Result<Vec<User>> {
        self.users.get_users(with_secrets).await
    }

    pub(crate) async fn list_users(&self, req: &ListUsersRequest) -> Result<ListUsersResponse> {
        self.users.list_users(req).await
    }
}

#[async_trait]
impl UpstreamFetch<User> for UserUpstream {
    async fn get_all(&self, load_secrets: bool) -> Result<Vec<User>> {
        self.users.get_users(load_secrets).await
    }
}

/// The page token that resumes a listing immediately after `name`.
///
/// Follows the backend key space: the range end of the exact key for `name`, with separator
/// bytes trimmed. Tokens are opaque to callers.
pub(crate) fn next_page_token(name: &str) -> String {
    let mut key = format!("/{name}/").into_bytes();
    if let Some(last) = key.last_mut() {
        *last += 1;
    }
    String::from_utf8_lossy(&key).trim_matches('/').to_string()
}

impl Cache {
    /// One user by name.
    ///
    /// A cache miss retries the upstream once: the method is never used to build derivative
    /// caches, so the stronger read is safe.
    #[tracing::instrument(skip(self))]
    pub async fn get_user(&self, name: &str, with_secrets: bool) -> Result<User> {
        let collection = self
            .shared
            .collections
            .users
            .as_ref()
            .ok_or_else(|| Error::unsupported("users are not tracked by this cache"))?;

        // The cache never tracks user secrets.
        if with_secrets {
            return collection.upstream.get_user(name, true).await;
        }

        let cached = {
            let guard = acquire_read_guard(&self.shared, &collection.watch);
            guard.read_cache().then(|| collection.store.get("name", name))
        };

        match cached {
            Some(Ok(user)) => Ok(user.without_secrets()),
            Some(Err(e)) if e.is_not_found() => {
                if let Ok(user) = collection.upstream.get_user(name, false).await {
                    return Ok(user);
                }
                Err(e)
            }
            Some(Err(e)) => Err(e),
            None => collection.upstream.get_user(name, false).await,
        }
    }

    /// All users.
    #[tracing::instrument(skip(self))]
    pub async fn get_users(&self, with_secrets: bool) -> Result<Vec<User>> {
        let collection = self
            .shared
            .collections
            .users
            .as_ref()
            .ok_or_else(|| Error::unsupported("users are not tracked by this cache"))?;

        // The cache never tracks user secrets.
        if with_secrets {
            return collection.upstream.get_users(true).await;
        }

        read_cached_resource(
            &self.shared,
            collection,
            |store| {
                Ok(store
                    .iterate("name", "", "")
                    .map(|user| user.without_secrets())
                    .collect())
            },
            collection.upstream.get_users(false),
        )
        .await
    }

    /// One page of users.
    #[tracing::instrument(skip(self, req))]
    pub async fn list_users(&self, req: &ListUsersRequest) -> Result<ListUsersResponse> {
        let collection = self
            .shared
            .collections
            .users
            .as_ref()
            .ok_or_else(|| Error::unsupported("users are not tracked by this cache"))?;

        // The cache never tracks user secrets.
        if req.with_secrets {
            return collection.upstream.list_users(req).await;
        }

        read_cached_resource(
            &self.shared,
            collection,
            |store| {
                let page_size = if req.page_size == 0 {
                    DEFAULT_PAGE_SIZE
                } else {
                    req.page_size
                };

                let mut resp = ListUsersResponse::default();
                for user in store.iterate("name", &req.page_token, "") {
                    if req.filter.as_ref().is_some_and(|f| !f.matches(&user)) {
                        continue;
                    }
                    if resp.users.len() == page_size {
                        if let Some(last) = resp.users.last() {
                            resp.next_page_token = next_page_token(&last.name);
                        }
                        break;
                    }
                    resp.users.push(user.without_secrets());
                }
                Ok(resp)
            },
            collection.upstream.list_users(req),
        )
        .await
    }
}
