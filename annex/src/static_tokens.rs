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
    backend::ClusterConfig,
    cache::Cache,
    collection::{Collection, UpstreamFetch},
    guard::read_cached_resource,
    store::SingletonStore,
    types::{StaticTokens, WatchKind},
};

pub(crate) type StaticTokensCollection =
    Collection<StaticTokens, SingletonStore<StaticTokens>, StaticTokensUpstream>;

pub(crate) fn new_static_tokens_collection(
    cluster_config: Arc<dyn ClusterConfig>,
    watch: WatchKind,
) -> StaticTokensCollection {
    Collection {
        store: Arc::new(SingletonStore::new()),
        upstream: StaticTokensUpstream { cluster_config },
        watch,
        header_transform: Some(|_| Ok(StaticTokens::default())),
        singleton: true,
    }
}

pub(crate) struct StaticTokensUpstream {
    cluster_config: Arc<dyn ClusterConfig>,
}

impl StaticTokensUpstream {
    pub(crate) async fn get_static_tokens(&self) -> Result<StaticTokens> {
        self.cluster_config.get_static_tokens().await
    }
}

#[async_trait]
impl UpstreamFetch<StaticTokens> for StaticTokensUpstream {
    async fn get_all(&self, _load_secrets: bool) -> Result<Vec<StaticTokens>> {
        Ok(vec![self.cluster_config.get_static_tokens().await?])
    }
}

impl Cache {
    /// The static tokens used to provision nodes.
    #[tracing::instrument(skip(self))]
    pub async fn get_static_tokens(&self) -> Result<StaticTokens> {
        let collection = self
            .shared
            .collections
            .static_tokens
            .as_ref()
            .ok_or_else(|| Error::unsupported("static tokens are not tracked by this cache"))?;

        read_cached_resource(
            &self.shared,
            collection,
            |store| store.get().map(|tokens| (*tokens).clone()),
            collection.upstream.get_static_tokens(),
        )
        .await
    }
}
