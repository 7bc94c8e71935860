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
    backend::Trust,
    cache::Cache,
    collection::{Collection, UpstreamFetch},
    fncache::FnCacheKey,
    guard::acquire_read_guard,
    sortcache::{next_key, IndexFn},
    store::{FilterFn, ResourceStore},
    types::{CertAuthId, CertAuthType, CertAuthority, CertAuthorityFilter, WatchKind},
};

pub(crate) type CertAuthorityCollection =
    Collection<CertAuthority, ResourceStore<CertAuthority>, CertAuthorityUpstream>;

pub(crate) fn new_cert_authority_collection(
    trust: Arc<dyn Trust>,
    watch: WatchKind,
) -> CertAuthorityCollection {
    let filter = CertAuthorityFilter::from_map(&watch.filter);

    let admission = {
        let filter = filter.clone();
        Arc::new(move |ca: &CertAuthority| filter.matches(ca)) as FilterFn<CertAuthority>
    };

    Collection {
        store: Arc::new(ResourceStore::with_filter(
            Some(admission),
            vec![(
                "id",
                Arc::new(|ca: &CertAuthority| ca.id().storage_key()) as IndexFn<CertAuthority>,
            )],
        )),
        upstream: CertAuthorityUpstream { trust, filter },
        watch,
        header_transform: Some(|header| {
            let ca_type = CertAuthType::parse(&header.sub_kind)?;
            Ok(CertAuthority::new(ca_type, header.name.clone()))
        }),
        singleton: false,
    }
}

pub(crate) struct CertAuthorityUpstream {
    trust: Arc<dyn Trust>,
    // Extracted from the watch filter once, to avoid rebuilding it on every snapshot.
    filter: CertAuthorityFilter,
}

impl CertAuthorityUpstream {
    pub(crate) async fn get_cert_authority(
        &self,
        id: &CertAuthId,
        load_signing_keys: bool,
    ) -> Result<CertAuthority> {
        self.trust.get_cert_authority(id, load_signing_keys).await
    }

    pub(crate) async fn get_cert_authorities(
        &self,
        ca_type: CertAuthType,
        load_signing_keys: bool,
    ) -> Result<Vec<CertAuthority>> {
        self.trust.get_cert_authorities(ca_type, load_signing_keys).await
    }
}

#[async_trait]
impl UpstreamFetch<CertAuthority> for CertAuthorityUpstream {
    async fn get_all(&self, load_secrets: bool) -> Result<Vec<CertAuthority>> {
        let mut authorities = Vec::new();
        for ca_type in CertAuthType::all() {
            let cas = match self.trust.get_cert_authorities(*ca_type, load_secrets).await {
                Ok(cas) => cas,
                // A type added in this major version may be unknown to an older upstream.
                Err(e) if e.is_unsupported() && ca_type.newly_added() => continue,
                Err(e) => return Err(e),
            };

            // The backend cannot yet filter bulk reads; filtering here keeps the snapshot
            // consistent with what the watch delivers.
            authorities.extend(cas.into_iter().filter(|ca| self.filter.matches(ca)));
        }
        Ok(authorities)
    }
}

impl Cache {
    /// One certificate authority by id. `load_signing_keys` controls whether signing keys are
    /// included; keyed reads are never served from the mirror.
    #[tracing::instrument(skip(self, id), fields(id = %id))]
    pub async fn get_cert_authority(
        &self,
        id: &CertAuthId,
        load_signing_keys: bool,
    ) -> Result<CertAuthority> {
        let collection = self
            .shared
            .collections
            .cert_authorities
            .as_ref()
            .ok_or_else(|| Error::unsupported("cert authorities are not tracked by this cache"))?;

        // When signing keys are requested, always read from the upstream.
        if load_signing_keys {
            return collection.upstream.get_cert_authority(id, true).await;
        }

        let cached = {
            let guard = acquire_read_guard(&self.shared, &collection.watch);
            guard
                .read_cache()
                .then(|| collection.store.get("id", &id.storage_key()))
        };

        match cached {
            Some(Ok(ca)) => Ok(ca.without_secrets()),
            Some(Err(e)) if e.is_not_found() => {
                if let Ok(ca) = collection.upstream.get_cert_authority(id, false).await {
                    return Ok(ca);
                }
                Err(e)
            }
            Some(Err(e)) => Err(e),
            None => {
                // When no keys are requested, memoize the upstream read to absorb bursts.
                let fn_cache = self.shared.fn_cache.load_full();
                let ca = fn_cache
                    .get::<CertAuthority, _, _>(FnCacheKey::CertAuthority(id.clone()), || async {
                        collection.upstream.get_cert_authority(id, false).await
                    })
                    .await?;
                Ok((*ca).clone())
            }
        }
    }

    /// All authorities of one type. `load_signing_keys` controls whether signing keys are
    /// included; keyed reads are never served from the mirror.
    #[tracing::instrument(skip(self))]
    pub async fn get_cert_authorities(
        &self,
        ca_type: CertAuthType,
        load_signing_keys: bool,
    ) -> Result<Vec<CertAuthority>> {
        let collection = self
            .shared
            .collections
            .cert_authorities
            .as_ref()
            .ok_or_else(|| Error::unsupported("cert authorities are not tracked by this cache"))?;

        // When signing keys are requested, always read from the upstream.
        if load_signing_keys {
            return collection.upstream.get_cert_authorities(ca_type, true).await;
        }

        let cached = {
            let guard = acquire_read_guard(&self.shared, &collection.watch);
            guard.read_cache().then(|| {
                collection
                    .store
                    .iterate("id", ca_type.as_str(), &next_key(ca_type.as_str()))
                    .map(|ca| ca.without_secrets())
                    .collect::<Vec<_>>()
            })
        };

        match cached {
            Some(cas) => Ok(cas),
            None => {
                // When no keys are requested, memoize the upstream read to absorb bursts.
                let fn_cache = self.shared.fn_cache.load_full();
                let cas = fn_cache
                    .get::<Vec<CertAuthority>, _, _>(
                        FnCacheKey::CertAuthorities(ca_type),
                        || async { collection.upstream.get_cert_authorities(ca_type, false).await },
                    )
                    .await?;
                Ok(cas.iter().cloned().collect())
            }
        }
    }
}
