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

//! Resource kinds, watch descriptors, and the event carrier model.

use std::{any::Any, collections::BTreeMap, fmt::Display};

pub mod cert_authority;
pub mod static_tokens;
pub mod user;

pub use cert_authority::{CertAuthId, CertAuthType, CertAuthority, CertAuthorityFilter, KeyPair};
pub use static_tokens::{ProvisionToken, StaticTokens, SystemRole};
pub use user::{ListUsersRequest, ListUsersResponse, LocalAuthSecrets, User, UserFilter};

/// The unqualified name of `T`, used in messages that name an expected element type.
pub(crate) fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}

/// A tag identifying a type of cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    /// The cluster-wide static provisioning tokens singleton.
    StaticTokens,
    /// Certificate authorities, keyed by `<type>/<domain>`.
    CertAuthority,
    /// Users, keyed by name.
    User,
}

impl Kind {
    /// The wire tag for the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::StaticTokens => "static_tokens",
            Kind::CertAuthority => "cert_authority",
            Kind::User => "user",
        }
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A watch descriptor: which kind to mirror, whether events carry secrets, and an opaque
/// per-kind filter.
///
/// The filter is opaque to the cache core; kinds whose collection understands it (certificate
/// authorities) parse it at collection construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchKind {
    /// The kind to watch.
    pub kind: Kind,
    /// Whether delivered resources include secrets.
    pub load_secrets: bool,
    /// Opaque per-kind filter.
    pub filter: BTreeMap<String, String>,
}

impl WatchKind {
    /// A watch for `kind` without secrets and without a filter.
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            load_secrets: false,
            filter: BTreeMap::new(),
        }
    }

    /// Request that delivered resources include secrets.
    pub fn with_load_secrets(mut self, load_secrets: bool) -> Self {
        self.load_secrets = load_secrets;
        self
    }

    /// Attach an opaque filter.
    pub fn with_filter(mut self, filter: BTreeMap<String, String>) -> Self {
        self.filter = filter;
        self
    }
}

/// An identity-only resource reference, delivered on deletes when the backend no longer has the
/// full value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHeader {
    /// The kind of the deleted resource.
    pub kind: Kind,
    /// A kind-specific refinement (the certificate authority type, for authorities).
    pub sub_kind: String,
    /// The identity of the deleted resource under its kind's primary index.
    pub name: String,
}

impl ResourceHeader {
    /// A header for `kind` with identity `name` and no sub-kind.
    pub fn new(kind: Kind, name: impl Into<String>) -> Self {
        Self {
            kind,
            sub_kind: String::new(),
            name: name.into(),
        }
    }

    /// Set the kind-specific sub-kind.
    pub fn with_sub_kind(mut self, sub_kind: impl Into<String>) -> Self {
        self.sub_kind = sub_kind.into();
        self
    }
}

/// A wrapped newer-schema resource that can be unwrapped into its native representation.
///
/// Backends that have migrated a kind to a newer schema deliver events in a wrapper; the
/// collection unwraps it and type-checks the result against the kind's native type.
pub trait Unwrappable: Send + Sync {
    /// Unwrap into the native resource value.
    fn unwrap_resource(self: Box<Self>) -> Box<dyn Any + Send + Sync>;

    /// The type name of the wrapped value, for diagnostics.
    fn wrapped_type(&self) -> &'static str;
}

/// A generic newer-schema wrapper around a native value.
#[derive(Debug, Clone)]
pub struct Wrapped<T>(pub T);

impl<T> Unwrappable for Wrapped<T>
where
    T: Any + Send + Sync,
{
    fn unwrap_resource(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        Box::new(self.0)
    }

    fn wrapped_type(&self) -> &'static str {
        short_type_name::<T>()
    }
}

/// The payload of a watch event.
///
/// Collections recover the kind's native type from the carrier: native values are downcast
/// directly, wrapped values are unwrapped first, and headers are converted through the
/// collection's header transform if it has one.
pub enum Resource {
    /// A native typed value.
    Native(Box<dyn Any + Send + Sync>),
    /// A wrapped newer-schema value.
    Wrapped(Box<dyn Unwrappable>),
    /// An identity-only reference.
    Header(ResourceHeader),
}

impl Resource {
    /// Wrap a native typed value.
    pub fn native<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Resource::Native(Box::new(value))
    }

    /// Wrap a newer-schema value.
    pub fn wrapped<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Resource::Wrapped(Box::new(Wrapped(value)))
    }

    /// Wrap an identity-only reference.
    pub fn header(header: ResourceHeader) -> Self {
        Resource::Header(header)
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Native(_) => f.write_str("Resource::Native(..)"),
            Resource::Wrapped(w) => write!(f, "Resource::Wrapped({})", w.wrapped_type()),
            Resource::Header(h) => write!(f, "Resource::Header({h:?})"),
        }
    }
}

/// The operation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// The resource was created or updated.
    Upsert,
    /// The resource was deleted.
    Delete,
}

/// A single watch event.
#[derive(Debug)]
pub struct Event {
    /// The operation.
    pub op: Op,
    /// The kind the event belongs to.
    pub kind: Kind,
    /// The resource carrier.
    pub resource: Resource,
}

/// The "watch established" marker, delivered before the first event.
///
/// `kinds` holds the watches the backend actually confirmed; a requested kind that is absent
/// here is not covered by this subscription and must not be served from the cache.
#[derive(Debug, Clone)]
pub struct WatchStatus {
    /// The confirmed watches.
    pub kinds: Vec<WatchKind>,
}

/// An item on a watch subscription stream.
#[derive(Debug)]
pub enum StreamItem {
    /// The subscription is established; events follow.
    Init(WatchStatus),
    /// A resource changed.
    Event(Event),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(Kind::StaticTokens.as_str(), "static_tokens");
        assert_eq!(Kind::CertAuthority.as_str(), "cert_authority");
        assert_eq!(Kind::User.as_str(), "user");
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<User>(), "User");
        assert_eq!(short_type_name::<StaticTokens>(), "StaticTokens");
        assert_eq!(short_type_name::<Vec<u8>>(), "Vec<u8>");
    }

    #[test]
    fn test_wrapped_unwraps_to_native() {
        let user = User::new("alice");
        let resource = Resource::wrapped(user.clone());
        match resource {
            Resource::Wrapped(w) => {
                assert_eq!(w.wrapped_type(), "User");
                let unwrapped = w.unwrap_resource().downcast::<User>().unwrap();
                assert_eq!(*unwrapped, user);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_watch_kind_equality_includes_filter() {
        let plain = WatchKind::new(Kind::CertAuthority);
        let filtered = WatchKind::new(Kind::CertAuthority)
            .with_filter(BTreeMap::from([("user".to_string(), "*".to_string())]));
        assert_ne!(plain, filtered);
        assert_eq!(plain, WatchKind::new(Kind::CertAuthority));
    }
}
