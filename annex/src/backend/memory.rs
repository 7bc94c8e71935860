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

//! An in-memory backend implementing every upstream contract.
//!
//! Serves as the authoritative source in tests and loopback deployments: mutations update the
//! held state and fan out watch events to every subscriber. A subscriber that falls behind its
//! event buffer is dropped, which fail-closes its stream.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use annex_common::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{ClusterConfig, Events, Subscription, Trust, Users};
use crate::{
    types::{
        CertAuthId, CertAuthType, CertAuthority, CertAuthorityFilter, Event, Kind,
        ListUsersRequest, ListUsersResponse, Op, Resource, ResourceHeader, StaticTokens,
        StreamItem, User, WatchKind, WatchStatus,
    },
    users::{next_page_token, DEFAULT_PAGE_SIZE},
};

const EVENT_BUFFER: usize = 1024;

struct Watcher {
    watches: Vec<WatchKind>,
    tx: mpsc::Sender<StreamItem>,
}

#[derive(Default)]
struct State {
    static_tokens: Option<StaticTokens>,
    cert_authorities: BTreeMap<String, CertAuthority>,
    users: BTreeMap<String, User>,
    watchers: Vec<Watcher>,
}

/// The in-memory backend.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,

    fail_watches: AtomicBool,
    fail_reads: AtomicBool,
    unsupported_ca_types: Mutex<BTreeSet<CertAuthType>>,

    config_reads: AtomicUsize,
    trust_reads: AtomicUsize,
    user_reads: AtomicUsize,
}

impl MemoryBackend {
    /// An empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_available(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::unavailable("backend is unavailable"));
        }
        Ok(())
    }

    /// Install or replace the static tokens singleton.
    pub fn set_static_tokens(&self, tokens: StaticTokens) {
        let mut state = self.state.lock();
        state.static_tokens = Some(tokens.clone());
        broadcast(&mut state, Kind::StaticTokens, Op::Upsert, |_| {
            Some(Resource::native(tokens.clone()))
        });
    }

    /// Remove the static tokens singleton.
    pub fn delete_static_tokens(&self) {
        let mut state = self.state.lock();
        state.static_tokens = None;
        broadcast(&mut state, Kind::StaticTokens, Op::Delete, |_| {
            Some(Resource::header(ResourceHeader::new(Kind::StaticTokens, "static-tokens")))
        });
    }

    /// Install or replace a certificate authority.
    pub fn upsert_cert_authority(&self, ca: CertAuthority) {
        let mut state = self.state.lock();
        state.cert_authorities.insert(ca.id().storage_key(), ca.clone());
        broadcast(&mut state, Kind::CertAuthority, Op::Upsert, |watch| {
            if !CertAuthorityFilter::from_map(&watch.filter).matches(&ca) {
                return None;
            }
            Some(if watch.load_secrets {
                Resource::native(ca.clone())
            } else {
                Resource::native(ca.without_secrets())
            })
        });
    }

    /// Remove a certificate authority.
    pub fn delete_cert_authority(&self, id: &CertAuthId) {
        let mut state = self.state.lock();
        state.cert_authorities.remove(&id.storage_key());
        broadcast(&mut state, Kind::CertAuthority, Op::Delete, |_| {
            Some(Resource::header(
                ResourceHeader::new(Kind::CertAuthority, id.domain.clone())
                    .with_sub_kind(id.ca_type.as_str()),
            ))
        });
    }

    /// Install or replace a user.
    ///
    /// Users are delivered to watchers in the newer-schema wrapper.
    pub fn upsert_user(&self, user: User) {
        let mut state = self.state.lock();
        state.users.insert(user.name.clone(), user.clone());
        broadcast(&mut state, Kind::User, Op::Upsert, |watch| {
            Some(if watch.load_secrets {
                Resource::wrapped(user.clone())
            } else {
                Resource::wrapped(user.without_secrets())
            })
        });
    }

    /// Remove a user.
    pub fn delete_user(&self, name: &str) {
        let mut state = self.state.lock();
        state.users.remove(name);
        broadcast(&mut state, Kind::User, Op::Delete, |_| {
            Some(Resource::header(ResourceHeader::new(Kind::User, name)))
        });
    }

    /// Drop every open subscription, fail-closing their streams.
    pub fn close_watchers(&self) {
        self.state.lock().watchers.clear();
    }

    /// Make [`Events::watch`] fail until reset.
    pub fn set_fail_watches(&self, fail: bool) {
        self.fail_watches.store(fail, Ordering::SeqCst);
    }

    /// Make every service read fail until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make bulk authority reads for `ca_type` fail with `Unsupported`, imitating an older
    /// backend that predates the type.
    pub fn set_unsupported_ca_type(&self, ca_type: CertAuthType, unsupported: bool) {
        let mut types = self.unsupported_ca_types.lock();
        if unsupported {
            types.insert(ca_type);
        } else {
            types.remove(&ca_type);
        }
    }

    /// How many trust reads have been served.
    pub fn trust_reads(&self) -> usize {
        self.trust_reads.load(Ordering::SeqCst)
    }

    /// How many user reads have been served.
    pub fn user_reads(&self) -> usize {
        self.user_reads.load(Ordering::SeqCst)
    }

    /// How many cluster-config reads have been served.
    pub fn config_reads(&self) -> usize {
        self.config_reads.load(Ordering::SeqCst)
    }
}

// Deliver one event to every watcher subscribed to `kind`, dropping watchers whose buffers are
// full or whose receivers are gone.
fn broadcast<F>(state: &mut State, kind: Kind, op: Op, make: F)
where
    F: Fn(&WatchKind) -> Option<Resource>,
{
    state.watchers.retain(|watcher| {
        let Some(watch) = watcher.watches.iter().find(|w| w.kind == kind) else {
            return true;
        };
        let Some(resource) = make(watch) else {
            return true;
        };
        let delivered = watcher
            .tx
            .try_send(StreamItem::Event(Event { op, kind, resource }))
            .is_ok();
        if !delivered {
            tracing::warn!("[memory backend]: dropping watcher that fell behind on kind {kind}");
        }
        delivered
    });
}

#[async_trait]
impl Events for MemoryBackend {
    async fn watch(&self, watches: Vec<WatchKind>) -> Result<Subscription> {
        if self.fail_watches.load(Ordering::SeqCst) {
            return Err(Error::unavailable("watch subscriptions are unavailable"));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tx.try_send(StreamItem::Init(WatchStatus {
            kinds: watches.clone(),
        }))
        .map_err(|_| Error::unavailable("failed to establish the watch"))?;

        self.state.lock().watchers.push(Watcher { watches, tx });
        Ok(Subscription::new(rx))
    }
}

#[async_trait]
impl ClusterConfig for MemoryBackend {
    async fn get_static_tokens(&self) -> Result<StaticTokens> {
        self.check_available()?;
        self.config_reads.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .static_tokens
            .clone()
            .ok_or_else(|| Error::not_found("static tokens are not configured"))
    }
}

#[async_trait]
impl Trust for MemoryBackend {
    async fn get_cert_authority(&self, id: &CertAuthId, load_signing_keys: bool) -> Result<CertAuthority> {
        self.check_available()?;
        self.trust_reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let ca = state
            .cert_authorities
            .get(&id.storage_key())
            .ok_or_else(|| Error::not_found(format!("cert authority {id} not found")))?;
        Ok(if load_signing_keys {
            ca.clone()
        } else {
            ca.without_secrets()
        })
    }

    async fn get_cert_authorities(
        &self,
        ca_type: CertAuthType,
        load_signing_keys: bool,
    ) -> Result<Vec<CertAuthority>> {
        self.check_available()?;
        if self.unsupported_ca_types.lock().contains(&ca_type) {
            return Err(Error::unsupported(format!(
                "cert authority type {ca_type} is not supported"
            )));
        }
        self.trust_reads.fetch_add(1, Ordering::SeqCst);

        let prefix = format!("{ca_type}/");
        let state = self.state.lock();
        Ok(state
            .cert_authorities
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, ca)| {
                if load_signing_keys {
                    ca.clone()
                } else {
                    ca.without_secrets()
                }
            })
            .collect())
    }
}

#[async_trait]
impl Users for MemoryBackend {
    async fn get_user(&self, name: &str, with_secrets: bool) -> Result<User> {
        self.check_available()?;
        self.user_reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let user = state
            .users
            .get(name)
            .ok_or_else(|| Error::not_found(format!("user {name:?} not found")))?;
        Ok(if with_secrets {
            user.clone()
        } else {
            user.without_secrets()
        })
    }

    async fn get_users(&self, with_secrets: bool) -> Result<Vec<User>> {
        self.check_available()?;
        self.user_reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Ok(state
            .users
            .values()
            .map(|user| {
                if with_secrets {
                    user.clone()
                } else {
                    user.without_secrets()
                }
            })
            .collect())
    }

    async fn list_users(&self, req: &ListUsersRequest) -> Result<ListUsersResponse> {
        self.check_available()?;
        self.user_reads.fetch_add(1, Ordering::SeqCst);

        let page_size = if req.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            req.page_size
        };

        let state = self.state.lock();
        let mut resp = ListUsersResponse::default();
        for user in state.users.range(req.page_token.clone()..).map(|(_, u)| u) {
            if req.filter.as_ref().is_some_and(|f| !f.matches(user)) {
                continue;
            }
            if resp.users.len() == page_size {
                if let Some(last) = resp.users.last() {
                    resp.next_page_token = next_page_token(&last.name);
                }
                break;
            }
            resp.users.push(if req.with_secrets {
                user.clone()
            } else {
                user.without_secrets()
            });
        }
        Ok(resp)
    }
}
