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

use std::collections::BTreeMap;

/// Login credentials and MFA state attached to a user.
///
/// Never stored in the cache; the watch delivers users without this field unless the watch
/// requested secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalAuthSecrets {
    /// The bcrypt hash of the user's password.
    pub password_hash: Vec<u8>,
    /// Registered MFA device identifiers.
    pub mfa_devices: Vec<String>,
}

/// A user record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// The login name. Identity under the `"name"` index.
    pub name: String,
    /// Assigned role names.
    pub roles: Vec<String>,
    /// Free-form user traits.
    pub traits: BTreeMap<String, Vec<String>>,
    /// Local credentials, if loaded.
    pub local_auth: Option<LocalAuthSecrets>,
}

impl User {
    /// A user with the given name and nothing else.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: Vec::new(),
            traits: BTreeMap::new(),
            local_auth: None,
        }
    }

    /// Assign roles.
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Attach local credentials.
    pub fn with_local_auth(mut self, secrets: LocalAuthSecrets) -> Self {
        self.local_auth = Some(secrets);
        self
    }

    /// A copy with credentials removed.
    pub fn without_secrets(&self) -> Self {
        Self {
            local_auth: None,
            ..self.clone()
        }
    }
}

/// A request for one page of users.
#[derive(Debug, Clone, Default)]
pub struct ListUsersRequest {
    /// Maximum number of users to return. Zero selects the server default.
    pub page_size: usize,
    /// Where to resume; empty starts from the beginning. Opaque to callers.
    pub page_token: String,
    /// Whether to include credentials.
    pub with_secrets: bool,
    /// An optional match predicate.
    pub filter: Option<UserFilter>,
}

/// A predicate over users, applied while listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFilter {
    /// Keywords that must all appear in the user's name or roles.
    pub search_keywords: Vec<String>,
}

impl UserFilter {
    /// Whether `user` satisfies the predicate.
    pub fn matches(&self, user: &User) -> bool {
        self.search_keywords.iter().all(|kw| {
            user.name.contains(kw.as_str()) || user.roles.iter().any(|r| r.contains(kw.as_str()))
        })
    }
}

/// One page of users.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListUsersResponse {
    /// The page contents, in ascending name order.
    pub users: Vec<User>,
    /// The token for the next page; empty when the listing is exhausted.
    pub next_page_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_without_secrets_drops_local_auth() {
        let user = User::new("alice").with_roles(["admin"]).with_local_auth(LocalAuthSecrets {
            password_hash: b"$2a$10$abc".to_vec(),
            mfa_devices: vec!["touch-id".to_string()],
        });

        let stripped = user.without_secrets();
        assert_eq!(stripped.name, "alice");
        assert_eq!(stripped.roles, vec!["admin".to_string()]);
        assert!(stripped.local_auth.is_none());
        assert!(user.local_auth.is_some());
    }

    #[test]
    fn test_user_filter_matches_name_and_roles() {
        let user = User::new("alice").with_roles(["editor", "auditor"]);

        assert!(UserFilter::default().matches(&user));
        assert!(UserFilter {
            search_keywords: vec!["ali".to_string()]
        }
        .matches(&user));
        assert!(UserFilter {
            search_keywords: vec!["audit".to_string()]
        }
        .matches(&user));
        assert!(!UserFilter {
            search_keywords: vec!["ali".to_string(), "owner".to_string()]
        }
        .matches(&user));
    }
}
