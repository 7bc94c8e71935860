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

//! The contracts the cache consumes from the authoritative backend.

use annex_common::error::{Error, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{
    CertAuthId, CertAuthType, CertAuthority, ListUsersRequest, ListUsersResponse, StaticTokens,
    StreamItem, User, WatchKind,
};

pub mod memory;

/// An open watch subscription.
///
/// The stream fail-closes: when the backend cannot keep up or hits an internal error it drops
/// its sender, and [`Subscription::recv`] surfaces that as `Unavailable`.
pub struct Subscription {
    rx: mpsc::Receiver<StreamItem>,
}

impl Subscription {
    /// Wrap a receiving channel half as a subscription.
    pub fn new(rx: mpsc::Receiver<StreamItem>) -> Self {
        Self { rx }
    }

    /// The next stream item.
    pub async fn recv(&mut self) -> Result<StreamItem> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::unavailable("watch subscription closed"))
    }
}

/// An event source over the backend.
#[async_trait]
pub trait Events: Send + Sync + 'static {
    /// Open a subscription over `watches`.
    ///
    /// The subscription delivers a watch-established marker naming the confirmed kinds before
    /// the first event.
    async fn watch(&self, watches: Vec<WatchKind>) -> Result<Subscription>;
}

/// Cluster-level configuration reads.
#[async_trait]
pub trait ClusterConfig: Send + Sync + 'static {
    /// The static provisioning tokens. `NotFound` when none are configured.
    async fn get_static_tokens(&self) -> Result<StaticTokens>;
}

/// Certificate authority reads.
#[async_trait]
pub trait Trust: Send + Sync + 'static {
    /// One authority by id.
    async fn get_cert_authority(&self, id: &CertAuthId, load_signing_keys: bool) -> Result<CertAuthority>;

    /// All authorities of one type.
    async fn get_cert_authorities(
        &self,
        ca_type: CertAuthType,
        load_signing_keys: bool,
    ) -> Result<Vec<CertAuthority>>;
}

/// User reads.
#[async_trait]
pub trait Users: Send + Sync + 'static {
    /// One user by name.
    async fn get_user(&self, name: &str, with_secrets: bool) -> Result<User>;

    /// All users.
    async fn get_users(&self, with_secrets: bool) -> Result<Vec<User>>;

    /// One page of users.
    async fn list_users(&self, req: &ListUsersRequest) -> Result<ListUsersResponse>;
}
