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

use std::time::SystemTime;

/// A role a provisioning token can join a node as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemRole {
    /// The auth service.
    Auth,
    /// A regular node.
    Node,
    /// A proxy.
    Proxy,
}

/// A pre-shared provisioning token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionToken {
    /// The token value.
    pub token: String,
    /// Roles the token can join as.
    pub roles: Vec<SystemRole>,
    /// Expiry, if any.
    pub expires: Option<SystemTime>,
}

/// The cluster-wide set of static provisioning tokens. A singleton: at most one value exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticTokens {
    /// The configured tokens.
    pub tokens: Vec<ProvisionToken>,
}

impl StaticTokens {
    /// A value holding `tokens`.
    pub fn new(tokens: Vec<ProvisionToken>) -> Self {
        Self { tokens }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_static_tokens_value_semantics() {
        let tokens = StaticTokens::new(vec![ProvisionToken {
            token: "static1".to_string(),
            roles: vec![SystemRole::Auth, SystemRole::Node],
            expires: Some(SystemTime::now() + Duration::from_secs(3600)),
        }]);

        let copy = tokens.clone();
        assert_eq!(tokens, copy);
        assert_eq!(copy.tokens.len(), 1);
        assert_eq!(copy.tokens[0].token, "static1");
    }
}
