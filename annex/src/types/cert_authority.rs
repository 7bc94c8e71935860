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

use std::{collections::BTreeMap, fmt::Display};

use annex_common::error::{Error, Result};

/// The role a certificate authority plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CertAuthType {
    /// Signs user certificates.
    User,
    /// Signs host certificates.
    Host,
    /// Signs database certificates.
    Db,
    /// Signs SAML service provider material.
    Saml,
    /// Signs OIDC tokens.
    Oidc,
    /// Signs workload identity documents.
    WorkloadIdentity,
}

impl CertAuthType {
    /// All authority types, in a fixed order.
    pub fn all() -> &'static [CertAuthType] {
        &[
            CertAuthType::User,
            CertAuthType::Host,
            CertAuthType::Db,
            CertAuthType::Saml,
            CertAuthType::Oidc,
            CertAuthType::WorkloadIdentity,
        ]
    }

    /// The wire tag for the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            CertAuthType::User => "user",
            CertAuthType::Host => "host",
            CertAuthType::Db => "db",
            CertAuthType::Saml => "saml",
            CertAuthType::Oidc => "oidc",
            CertAuthType::WorkloadIdentity => "workload_identity",
        }
    }

    /// Parse a wire tag.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(CertAuthType::User),
            "host" => Ok(CertAuthType::Host),
            "db" => Ok(CertAuthType::Db),
            "saml" => Ok(CertAuthType::Saml),
            "oidc" => Ok(CertAuthType::Oidc),
            "workload_identity" => Ok(CertAuthType::WorkloadIdentity),
            other => Err(Error::bad_input(format!("unknown certificate authority type {other:?}"))),
        }
    }

    /// Whether the type was added in the current major version.
    ///
    /// Older upstreams reject bulk reads for types they don't know about; the snapshot path
    /// tolerates that for newly added types instead of failing the whole generation.
    pub fn newly_added(&self) -> bool {
        matches!(self, CertAuthType::WorkloadIdentity)
    }
}

impl Display for CertAuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identity of a certificate authority: its type and the domain it serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CertAuthId {
    /// The authority type.
    pub ca_type: CertAuthType,
    /// The cluster domain.
    pub domain: String,
}

impl CertAuthId {
    /// An id for `ca_type` over `domain`.
    pub fn new(ca_type: CertAuthType, domain: impl Into<String>) -> Self {
        Self {
            ca_type,
            domain: domain.into(),
        }
    }

    /// The `<type>/<domain>` key the authority is stored under.
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.ca_type, self.domain)
    }
}

impl Display for CertAuthId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ca_type, self.domain)
    }
}

/// A signing key pair. The private half is the secret and is stripped from cached copies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPair {
    /// The public key, PEM encoded.
    pub public_key: Vec<u8>,
    /// The private key, PEM encoded, if loaded.
    pub private_key: Option<Vec<u8>>,
}

/// A certificate authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertAuthority {
    /// The authority type.
    pub ca_type: CertAuthType,
    /// The cluster domain the authority serves.
    pub domain: String,
    /// The authority's key material.
    pub key_pairs: Vec<KeyPair>,
}

impl CertAuthority {
    /// An authority of `ca_type` over `domain` with no key material.
    pub fn new(ca_type: CertAuthType, domain: impl Into<String>) -> Self {
        Self {
            ca_type,
            domain: domain.into(),
            key_pairs: Vec::new(),
        }
    }

    /// Attach key material.
    pub fn with_key_pairs(mut self, key_pairs: Vec<KeyPair>) -> Self {
        self.key_pairs = key_pairs;
        self
    }

    /// The authority's identity.
    pub fn id(&self) -> CertAuthId {
        CertAuthId::new(self.ca_type, self.domain.clone())
    }

    /// A copy with all private keys removed.
    pub fn without_secrets(&self) -> Self {
        Self {
            key_pairs: self
                .key_pairs
                .iter()
                .map(|kp| KeyPair {
                    public_key: kp.public_key.clone(),
                    private_key: None,
                })
                .collect(),
            ..self.clone()
        }
    }
}

/// A whitelist of authority types, optionally pinned to a domain.
///
/// Parsed from a watch descriptor's opaque filter map: each entry maps an authority type tag to
/// a domain, with `"*"` admitting any domain. An empty filter admits everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertAuthorityFilter {
    allow: BTreeMap<CertAuthType, String>,
}

impl CertAuthorityFilter {
    /// Parse the filter from a watch descriptor's filter map. Unknown keys are ignored so that
    /// newer peers can add entries without breaking older readers.
    pub fn from_map(filter: &BTreeMap<String, String>) -> Self {
        let allow = filter
            .iter()
            .filter_map(|(k, v)| CertAuthType::parse(k).ok().map(|t| (t, v.clone())))
            .collect();
        Self { allow }
    }

    /// Render the filter back into a watch descriptor's filter map.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.allow
            .iter()
            .map(|(t, d)| (t.as_str().to_string(), d.clone()))
            .collect()
    }

    /// Whether the filter admits everything.
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty()
    }

    /// Whether the filter admits `ca`.
    pub fn matches(&self, ca: &CertAuthority) -> bool {
        if self.allow.is_empty() {
            return true;
        }
        match self.allow.get(&ca.ca_type) {
            Some(domain) => domain == "*" || *domain == ca.domain,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags_round_trip() {
        for t in CertAuthType::all() {
            assert_eq!(CertAuthType::parse(t.as_str()).unwrap(), *t);
        }
        assert!(CertAuthType::parse("jwt").unwrap_err().is_bad_input());
    }

    #[test]
    fn test_storage_key() {
        let ca = CertAuthority::new(CertAuthType::Host, "example.com");
        assert_eq!(ca.id().storage_key(), "host/example.com");
    }

    #[test]
    fn test_without_secrets_strips_private_keys() {
        let ca = CertAuthority::new(CertAuthType::User, "root").with_key_pairs(vec![KeyPair {
            public_key: b"pub".to_vec(),
            private_key: Some(b"priv".to_vec()),
        }]);

        let stripped = ca.without_secrets();
        assert_eq!(stripped.key_pairs.len(), 1);
        assert_eq!(stripped.key_pairs[0].public_key, b"pub".to_vec());
        assert!(stripped.key_pairs[0].private_key.is_none());
        assert!(ca.key_pairs[0].private_key.is_some());
    }

    #[test]
    fn test_filter_from_map() {
        let filter = CertAuthorityFilter::from_map(&BTreeMap::from([
            ("user".to_string(), "*".to_string()),
            ("host".to_string(), "root".to_string()),
            ("bogus".to_string(), "*".to_string()),
        ]));

        assert!(filter.matches(&CertAuthority::new(CertAuthType::User, "anywhere")));
        assert!(filter.matches(&CertAuthority::new(CertAuthType::Host, "root")));
        assert!(!filter.matches(&CertAuthority::new(CertAuthType::Host, "leaf")));
        assert!(!filter.matches(&CertAuthority::new(CertAuthType::Saml, "root")));
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let filter = CertAuthorityFilter::default();
        assert!(filter.is_empty());
        for t in CertAuthType::all() {
            assert!(filter.matches(&CertAuthority::new(*t, "root")));
        }
    }
}
