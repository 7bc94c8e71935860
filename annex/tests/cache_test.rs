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

//! Whole-cache lifecycle tests driven through the in-memory backend.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use annex::{
    Cache, CertAuthId, CertAuthType, CertAuthority, Events, KeyPair, Kind, ListUsersRequest,
    MemoryBackend, ProvisionToken, Result, StaticTokens, StreamItem, Subscription, SystemRole,
    User, WatchKind, WatchStatus,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

const FAST_BACKOFF: (Duration, Duration) = (Duration::from_millis(10), Duration::from_millis(50));

fn build_cache(backend: Arc<MemoryBackend>, watches: Vec<WatchKind>) -> Cache {
    Cache::builder()
        .with_backend(backend)
        .with_watches(watches)
        .with_backoff(FAST_BACKOFF.0, FAST_BACKOFF.1)
        .build()
        .expect("cache construction")
}

async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn static_tokens() -> StaticTokens {
    StaticTokens::new(vec![ProvisionToken {
        token: "static1".to_string(),
        roles: vec![SystemRole::Auth, SystemRole::Node],
        expires: Some(std::time::SystemTime::now() + Duration::from_secs(3600)),
    }])
}

#[tokio::test]
async fn test_users_are_mirrored_and_served_locally() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_user(User::new("alice"));

    let cache = build_cache(backend.clone(), vec![WatchKind::new(Kind::User)]);
    cache.wait_ready().await;

    let users = cache.get_users(false).await.unwrap();
    assert_eq!(users, vec![User::new("alice")]);

    // Events keep the mirror current without touching the upstream.
    backend.upsert_user(User::new("bob"));
    assert!(
        eventually(|| async { cache.get_users(false).await.unwrap().len() == 2 }).await,
        "the upsert event never reached the mirror"
    );

    backend.delete_user("alice");
    assert!(
        eventually(|| async {
            cache.get_users(false).await.unwrap() == vec![User::new("bob")]
        })
        .await,
        "the delete event never reached the mirror"
    );

    let reads_before = backend.user_reads();
    for _ in 0..10 {
        cache.get_users(false).await.unwrap();
    }
    assert_eq!(backend.user_reads(), reads_before);

    cache.close().await;
}

#[tokio::test]
async fn test_get_user_cache_miss_retries_upstream_once() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = build_cache(backend.clone(), vec![WatchKind::new(Kind::User)]);
    cache.wait_ready().await;

    // Present upstream but not yet mirrored: the miss falls through once.
    {
        let mut state_only = User::new("carol");
        state_only.roles = vec!["editor".to_string()];
        backend.close_watchers();
        backend.upsert_user(state_only.clone());
        // Reconnect will mirror carol eventually, but the very first miss is served upstream.
        let user = cache.get_user("carol", false).await.unwrap();
        assert_eq!(user, state_only);
    }

    cache.close().await;
}

#[tokio::test]
async fn test_user_secrets_always_come_from_upstream() {
    let backend = Arc::new(MemoryBackend::new());
    let mut alice = User::new("alice");
    alice.local_auth = Some(annex::LocalAuthSecrets {
        password_hash: b"hash".to_vec(),
        mfa_devices: vec![],
    });
    backend.upsert_user(alice.clone());

    let cache = build_cache(backend.clone(), vec![WatchKind::new(Kind::User)]);
    cache.wait_ready().await;

    let reads_before = backend.user_reads();
    let with_secrets = cache.get_user("alice", true).await.unwrap();
    assert!(with_secrets.local_auth.is_some());
    assert_eq!(backend.user_reads(), reads_before + 1);

    let without_secrets = cache.get_user("alice", false).await.unwrap();
    assert!(without_secrets.local_auth.is_none());

    cache.close().await;
}

#[tokio::test]
async fn test_paginated_user_listing() {
    let backend = Arc::new(MemoryBackend::new());
    for name in ["alice", "bob", "carol"] {
        backend.upsert_user(User::new(name));
    }

    let cache = build_cache(backend.clone(), vec![WatchKind::new(Kind::User)]);
    cache.wait_ready().await;

    let page = cache
        .list_users(&ListUsersRequest {
            page_size: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        page.users.iter().map(|u| u.name.as_str()).collect::<Vec<_>>(),
        vec!["alice", "bob"]
    );
    assert!(!page.next_page_token.is_empty());

    let page = cache
        .list_users(&ListUsersRequest {
            page_size: 2,
            page_token: page.next_page_token,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        page.users.iter().map(|u| u.name.as_str()).collect::<Vec<_>>(),
        vec!["carol"]
    );
    assert!(page.next_page_token.is_empty());

    let page = cache
        .list_users(&ListUsersRequest {
            page_size: 2,
            page_token: "carol0".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(page.users.is_empty());
    assert!(page.next_page_token.is_empty());

    cache.close().await;
}

#[tokio::test]
async fn test_static_tokens_lifecycle() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_static_tokens(static_tokens());

    let cache = build_cache(backend.clone(), vec![WatchKind::new(Kind::StaticTokens)]);
    cache.wait_ready().await;

    assert_eq!(cache.get_static_tokens().await.unwrap(), static_tokens());

    backend.delete_static_tokens();
    assert!(
        eventually(|| async {
            cache
                .get_static_tokens()
                .await
                .is_err_and(|e| e.is_not_found())
        })
        .await,
        "the singleton delete never reached the mirror"
    );

    cache.close().await;
}

#[tokio::test]
async fn test_cert_authority_watch_filter() {
    let backend = Arc::new(MemoryBackend::new());
    for (ca_type, domain) in [
        (CertAuthType::User, "root"),
        (CertAuthType::Host, "root"),
        (CertAuthType::Saml, "root"),
    ] {
        backend.upsert_cert_authority(CertAuthority::new(ca_type, domain));
    }

    let filter = BTreeMap::from([
        ("user".to_string(), "*".to_string()),
        ("host".to_string(), "*".to_string()),
    ]);
    let cache = build_cache(
        backend.clone(),
        vec![WatchKind::new(Kind::CertAuthority).with_filter(filter)],
    );
    cache.wait_ready().await;

    let user_cas = cache.get_cert_authorities(CertAuthType::User, false).await.unwrap();
    assert_eq!(user_cas.len(), 1);
    assert_eq!(user_cas[0].domain, "root");

    let host_cas = cache.get_cert_authorities(CertAuthType::Host, false).await.unwrap();
    assert_eq!(host_cas.len(), 1);

    // Filtered out of the mirror entirely.
    let saml_cas = cache.get_cert_authorities(CertAuthType::Saml, false).await.unwrap();
    assert!(saml_cas.is_empty());

    cache.close().await;
}

#[tokio::test]
async fn test_load_signing_keys_always_bypasses_the_mirror() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_cert_authority(
        CertAuthority::new(CertAuthType::User, "root").with_key_pairs(vec![KeyPair {
            public_key: b"pub".to_vec(),
            private_key: Some(b"priv".to_vec()),
        }]),
    );

    let cache = build_cache(backend.clone(), vec![WatchKind::new(Kind::CertAuthority)]);
    cache.wait_ready().await;

    let id = CertAuthId::new(CertAuthType::User, "root");

    // Mirror reads do not touch the upstream and never expose private keys.
    let reads_before = backend.trust_reads();
    let ca = cache.get_cert_authority(&id, false).await.unwrap();
    assert!(ca.key_pairs[0].private_key.is_none());
    assert_eq!(backend.trust_reads(), reads_before);

    // Signing-key reads go upstream every time, regardless of cache readiness.
    let ca = cache.get_cert_authority(&id, true).await.unwrap();
    assert!(ca.key_pairs[0].private_key.is_some());
    let ca = cache.get_cert_authority(&id, true).await.unwrap();
    assert!(ca.key_pairs[0].private_key.is_some());
    assert_eq!(backend.trust_reads(), reads_before + 2);

    cache.close().await;
}

#[tokio::test]
async fn test_upstream_fallback_memoizes_bursts() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_cert_authority(CertAuthority::new(CertAuthType::User, "root"));
    backend.set_fail_watches(true);

    // The engine can never subscribe, so every read falls through to the upstream.
    let cache = build_cache(backend.clone(), vec![WatchKind::new(Kind::CertAuthority)]);

    let id = CertAuthId::new(CertAuthType::User, "root");
    let reads_before = backend.trust_reads();
    for _ in 0..5 {
        cache.get_cert_authority(&id, false).await.unwrap();
    }
    assert_eq!(backend.trust_reads(), reads_before + 1);

    cache.close().await;
}

#[tokio::test]
async fn test_unsupported_kind() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = build_cache(backend.clone(), vec![WatchKind::new(Kind::User)]);
    cache.wait_ready().await;

    let err = cache.get_static_tokens().await.unwrap_err();
    assert!(err.is_unsupported());

    let err = cache
        .get_cert_authorities(CertAuthType::User, false)
        .await
        .unwrap_err();
    assert!(err.is_unsupported());

    cache.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_watch_reinit_under_load() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_user(User::new("alice"));
    backend.upsert_user(User::new("bob"));

    let cache = Arc::new(build_cache(backend.clone(), vec![WatchKind::new(Kind::User)]));
    cache.wait_ready().await;

    let stop = Arc::new(AtomicBool::new(false));
    let violated = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            let stop = stop.clone();
            let violated = violated.clone();
            tokio::spawn(async move {
                while !stop.load(Ordering::Relaxed) {
                    if let Ok(users) = cache.get_users(false).await {
                        let names: Vec<&str> = users.iter().map(|u| u.name.as_str()).collect();
                        // alice is deleted before the reinit and carol added after it; no
                        // consistent snapshot contains both.
                        if names.contains(&"alice") && names.contains(&"carol") {
                            violated.store(true, Ordering::Relaxed);
                        }
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    // Kill the stream, change the world, and let the engine reinitialize onto the new state.
    backend.close_watchers();
    backend.delete_user("alice");
    backend.upsert_user(User::new("carol"));

    cache.wait_for_generation(2).await;
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.await.unwrap();
    }

    assert!(!violated.load(Ordering::Relaxed), "a reader observed a merged snapshot");

    assert!(
        eventually(|| async {
            let mut names: Vec<String> = cache
                .get_users(false)
                .await
                .unwrap()
                .into_iter()
                .map(|u| u.name)
                .collect();
            names.sort();
            names == vec!["bob".to_string(), "carol".to_string()]
        })
        .await,
        "the mirror never converged on the new snapshot"
    );

    cache.close().await;
}

#[tokio::test]
async fn test_generation_is_monotonic_across_recoveries() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = build_cache(backend.clone(), vec![WatchKind::new(Kind::User)]);
    cache.wait_ready().await;

    let first = cache.generation();
    assert!(first >= 1);

    backend.close_watchers();
    cache.wait_for_generation(first + 1).await;
    assert!(cache.generation() > first);

    cache.close().await;
}

#[tokio::test]
async fn test_reads_fall_through_after_close() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_user(User::new("alice"));

    let cache = build_cache(backend.clone(), vec![WatchKind::new(Kind::User)]);
    cache.wait_ready().await;
    cache.close().await;

    let reads_before = backend.user_reads();
    let users = cache.get_users(false).await.unwrap();
    assert_eq!(users, vec![User::new("alice")]);
    assert_eq!(backend.user_reads(), reads_before + 1);
}

/// Delegates to the in-memory backend but confirms only some of the requested kinds, the way a
/// backend that cannot serve a kind reports partial watch success.
struct PartialEvents {
    inner: Arc<MemoryBackend>,
    confirm_only: Vec<Kind>,
}

#[async_trait]
impl Events for PartialEvents {
    async fn watch(&self, watches: Vec<WatchKind>) -> Result<Subscription> {
        let mut sub = self.inner.watch(watches).await?;
        let status = match sub.recv().await? {
            StreamItem::Init(status) => status,
            _ => unreachable!("the memory backend always inits first"),
        };

        let confirmed: Vec<WatchKind> = status
            .kinds
            .into_iter()
            .filter(|w| self.confirm_only.contains(&w.kind))
            .collect();

        let (tx, rx) = mpsc::channel(1024);
        let _ = tx.try_send(StreamItem::Init(WatchStatus { kinds: confirmed }));
        tokio::spawn(async move {
            while let Ok(item) = sub.recv().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::new(rx))
    }
}

#[tokio::test]
async fn test_unconfirmed_kinds_fall_through_to_upstream() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_user(User::new("alice"));
    backend.set_static_tokens(static_tokens());

    let cache = Cache::builder()
        .with_events(Arc::new(PartialEvents {
            inner: backend.clone(),
            confirm_only: vec![Kind::User],
        }))
        .with_cluster_config(backend.clone())
        .with_trust(backend.clone())
        .with_users(backend.clone())
        .with_watches(vec![WatchKind::new(Kind::User), WatchKind::new(Kind::StaticTokens)])
        .with_backoff(FAST_BACKOFF.0, FAST_BACKOFF.1)
        .build()
        .unwrap();
    cache.wait_ready().await;

    // Users were confirmed: local reads.
    let reads_before = backend.user_reads();
    cache.get_users(false).await.unwrap();
    assert_eq!(backend.user_reads(), reads_before);

    // Static tokens were not: every read goes upstream.
    let reads_before = backend.config_reads();
    cache.get_static_tokens().await.unwrap();
    cache.get_static_tokens().await.unwrap();
    assert_eq!(backend.config_reads(), reads_before + 2);

    cache.close().await;
}
