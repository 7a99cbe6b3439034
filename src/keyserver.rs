//! Key-server client cache (§4.9): lazily resolves and remembers a
//! `KeyServerClient` handle plus its advertised capabilities per domain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::hashchain::KeyServerClient;

#[derive(Debug, Error)]
pub enum KeyServerCacheError {
    #[error("key server for domain {0} does not advertise method {1}")]
    MissingMethod(String, String),
    #[error("no client constructor registered for domain {0}")]
    NoClient(String),
}

/// `CAPABILITIES{METHODS[], TKNPUBKEY, SIGPUBKEY, …}` of §6.2, trimmed to
/// what the cache itself needs to gate on.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub methods: Vec<String>,
    pub token_pub_key: [u8; 32],
    pub sig_pub_key: [u8; 32],
}

impl Capabilities {
    pub fn supports(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

/// Constructs a client handle and fetches its capabilities for a domain
/// it hasn't seen yet. Production wires this to `ReqwestKeyServerClient`
/// plus a `Capabilities` RPC; tests supply a closure over a fake.
#[async_trait::async_trait]
pub trait KeyServerResolver: Send + Sync {
    async fn resolve(
        &self,
        domain: &str,
    ) -> Result<(Arc<dyn KeyServerClient>, Capabilities), KeyServerCacheError>;
}

pub struct KeyServerCache {
    resolver: Arc<dyn KeyServerResolver>,
    entries: Mutex<HashMap<String, (Arc<dyn KeyServerClient>, Capabilities)>>,
    pool: Option<sqlx::SqlitePool>,
}

impl KeyServerCache {
    pub fn new(resolver: Arc<dyn KeyServerResolver>) -> Self {
        Self {
            resolver,
            entries: Mutex::new(HashMap::new()),
            pool: None,
        }
    }

    /// Like `new`, but every freshly resolved domain's method list is also
    /// written to `keyserver_capabilities` (§3.8). The client handle itself
    /// can't be persisted and is always re-resolved on a cache miss; the
    /// persisted row only lets `load_persisted_methods` answer "what did we
    /// last see this key server advertise" across a restart, e.g. for
    /// diagnostics.
    pub fn new_with_persistence(resolver: Arc<dyn KeyServerResolver>, pool: sqlx::SqlitePool) -> Self {
        Self {
            pool: Some(pool),
            ..Self::new(resolver)
        }
    }

    /// `get(domain, required_method)`: lazily resolves the domain, then
    /// hard-errors if `required_method` is missing from its capability set.
    pub async fn get(
        &self,
        domain: &str,
        required_method: &str,
    ) -> Result<Arc<dyn KeyServerClient>, KeyServerCacheError> {
        let mut guard = self.entries.lock().await;
        if !guard.contains_key(domain) {
            let resolved = self.resolver.resolve(domain).await?;
            if let Some(pool) = &self.pool {
                let methods_json = serde_json::to_string(&resolved.1.methods).unwrap_or_default();
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .expect("system clock before epoch")
                    .as_secs() as i64;
                if let Err(e) =
                    crate::db::save_keyserver_capabilities(pool, domain, &methods_json, now).await
                {
                    eprintln!("[keyserver] failed to persist capabilities for {domain}: {e}");
                }
            }
            guard.insert(domain.to_string(), resolved);
        }
        let (client, capabilities) = guard.get(domain).expect("just inserted");
        if !capabilities.supports(required_method) {
            return Err(KeyServerCacheError::MissingMethod(
                domain.to_string(),
                required_method.to_string(),
            ));
        }
        Ok(client.clone())
    }

    /// Returns the method list and fetch time last persisted for `domain`,
    /// without touching the resolver or the in-memory cache.
    pub async fn load_persisted_methods(&self, domain: &str) -> Option<(Vec<String>, i64)> {
        let pool = self.pool.as_ref()?;
        let (methods_json, fetched_at) = crate::db::load_keyserver_capabilities(pool, domain)
            .await
            .ok()
            .flatten()?;
        let methods: Vec<String> = serde_json::from_str(&methods_json).ok()?;
        Some((methods, fetched_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashchain::{HashChainEntry, HashChainError, UidMessageReply};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedClient;

    #[async_trait::async_trait]
    impl KeyServerClient for FixedClient {
        async fn fetch_last(&self) -> Result<(HashChainEntry, u64), HashChainError> {
            Err(HashChainError::Rpc("unused in this test".into()))
        }
        async fn fetch_range(
            &self,
            _start: u64,
            _end: u64,
        ) -> Result<Vec<(HashChainEntry, [u8; 32])>, HashChainError> {
            Ok(vec![])
        }
        async fn lookup_by_identity(&self, _mapped_id: &str) -> Result<Vec<u64>, HashChainError> {
            Ok(vec![])
        }
        async fn fetch_uid(&self, _uid_index: &[u8; 32]) -> Result<UidMessageReply, HashChainError> {
            Err(HashChainError::Rpc("unused in this test".into()))
        }
    }

    struct CountingResolver {
        calls: AtomicUsize,
        methods: Vec<String>,
    }

    #[async_trait::async_trait]
    impl KeyServerResolver for CountingResolver {
        async fn resolve(
            &self,
            _domain: &str,
        ) -> Result<(Arc<dyn KeyServerClient>, Capabilities), KeyServerCacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((
                Arc::new(FixedClient),
                Capabilities {
                    methods: self.methods.clone(),
                    token_pub_key: [0u8; 32],
                    sig_pub_key: [0u8; 32],
                },
            ))
        }
    }

    #[tokio::test]
    async fn resolves_once_and_caches() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            methods: vec!["KeyRepository.FetchUID".into()],
        });
        let cache = KeyServerCache::new(resolver.clone());
        cache.get("mute.berlin", "KeyRepository.FetchUID").await.unwrap();
        cache.get("mute.berlin", "KeyRepository.FetchUID").await.unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_method_is_a_hard_error() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            methods: vec!["KeyHashchain.FetchLastHashChain".into()],
        });
        let cache = KeyServerCache::new(resolver);
        let result = cache.get("mute.berlin", "KeyRepository.FetchUID").await;
        assert!(matches!(result, Err(KeyServerCacheError::MissingMethod(_, _))));
    }

    #[tokio::test]
    async fn resolved_capabilities_are_persisted_and_reloadable() {
        use sqlx::sqlite::SqlitePoolOptions;

        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();

        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            methods: vec!["KeyRepository.FetchUID".into()],
        });
        let cache = KeyServerCache::new_with_persistence(resolver, pool);
        cache.get("mute.berlin", "KeyRepository.FetchUID").await.unwrap();

        let (methods, fetched_at) = cache.load_persisted_methods("mute.berlin").await.unwrap();
        assert_eq!(methods, vec!["KeyRepository.FetchUID".to_string()]);
        assert!(fetched_at > 0);
        assert!(cache.load_persisted_methods("unknown.example").await.is_none());
    }
}
