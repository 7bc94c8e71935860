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

pub use annex_common::{
    backoff::ExponentialBackoff,
    clock::{Clock, ManualClock, SharedClock, SystemClock},
    error::{Error, ErrorKind, Result},
};

pub use crate::{
    backend::{memory::MemoryBackend, ClusterConfig, Events, Subscription, Trust, Users},
    cache::{Cache, CacheBuilder, Config, DEFAULT_FN_CACHE_TTL},
    fncache::{FnCache, FnCacheKey},
    metrics::Metrics,
    sortcache::{next_key, IndexFn, SortCache, SortCacheConfig},
    store::{FilterFn, ResourceStore, SingletonStore, Store},
    types::{
        CertAuthId, CertAuthType, CertAuthority, CertAuthorityFilter, Event, KeyPair, Kind,
        ListUsersRequest, ListUsersResponse, LocalAuthSecrets, Op, ProvisionToken, Resource,
        ResourceHeader, StaticTokens, StreamItem, SystemRole, Unwrappable, User, UserFilter,
        WatchKind, WatchStatus, Wrapped,
    },
};
