// API-key directory
//
// Maps a presented API key to its authoritative project id. Two tiers:
// a SHA-256 cache for keys this process has already verified, and a slow
// path that verifies the key against every project's stored Argon2
// verifier hash. The slow path runs once per distinct key; misses are
// cached with a short TTL so rotated keys start working within a minute.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::RwLock;

/// API key prefix; everything else is rejected before any lookup.
pub const API_KEY_PREFIX: &str = "ak_";
/// Minimum total key length: the prefix plus 24 printable characters.
pub const MIN_KEY_LEN: usize = 27;
pub const MAX_KEY_LEN: usize = 128;

/// How long a verification miss is remembered before the slow path may
/// run again for the same key. Bounds the cost of garbage keys while
/// letting rotated keys take effect quickly.
const NEGATIVE_TTL: Duration = Duration::from_secs(60);
const MAX_CACHE_ENTRIES: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum KeyDirError {
    #[error("unknown api key")]
    UnknownKey,
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

/// One project's key material as exposed by the metadata store.
#[derive(Debug, Clone)]
pub struct ProjectKey {
    pub project_id: String,
    /// Self-describing PHC verifier string.
    pub verifier_hash: String,
}

/// Read-only view of the metadata store's project keys.
#[async_trait]
pub trait ProjectKeyStore: Send + Sync {
    async fn lookup_all_project_keys(&self) -> Result<Vec<ProjectKey>, KeyDirError>;
}

/// Postgres-backed key store.
pub struct PgProjectKeyStore {
    pool: PgPool,
}

impl PgProjectKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, KeyDirError> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| KeyDirError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ProjectKeyStore for PgProjectKeyStore {
    async fn lookup_all_project_keys(&self) -> Result<Vec<ProjectKey>, KeyDirError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, api_key_hash
            FROM projects
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KeyDirError::Unavailable(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(project_id, verifier_hash)| ProjectKey {
                project_id,
                verifier_hash,
            })
            .collect())
    }
}

/// Fixed key store for tests and local development.
#[derive(Default)]
pub struct StaticProjectKeyStore {
    keys: Vec<ProjectKey>,
    lookups: std::sync::atomic::AtomicUsize,
    failing: std::sync::atomic::AtomicBool,
}

impl StaticProjectKeyStore {
    pub fn new(keys: Vec<ProjectKey>) -> Self {
        Self {
            keys,
            lookups: std::sync::atomic::AtomicUsize::new(0),
            failing: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// How many times the slow path has hit this store.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// When set, lookups fail with `Unavailable` until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl ProjectKeyStore for StaticProjectKeyStore {
    async fn lookup_all_project_keys(&self) -> Result<Vec<ProjectKey>, KeyDirError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(KeyDirError::Unavailable("store offline".to_string()));
        }
        self.lookups
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.keys.clone())
    }
}

/// Check the `ak_` key shape without touching cache or storage.
pub fn is_valid_key_format(key: &str) -> bool {
    key.starts_with(API_KEY_PREFIX)
        && (MIN_KEY_LEN..=MAX_KEY_LEN).contains(&key.len())
        && key.chars().all(|c| c.is_ascii_graphic())
}

/// Hash a key with Argon2id for storage in the metadata store.
pub fn hash_key_verifier(key: &str) -> Result<String, KeyDirError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(key.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| KeyDirError::Unavailable(format!("verifier hashing failed: {e}")))
}

fn fast_hash(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

enum CacheEntry {
    Valid(String),
    Invalid { expires_at: Instant },
}

/// Two-tier key resolver.
pub struct KeyDirectory {
    store: Arc<dyn ProjectKeyStore>,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl KeyDirectory {
    pub fn new(store: Arc<dyn ProjectKeyStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a presented key to its project id.
    ///
    /// Returns `UnknownKey` for malformed or unverifiable keys and
    /// `Unavailable` when the metadata store cannot be reached (callers
    /// must not conflate the two: one is a 401, the other a 503).
    pub async fn resolve(&self, presented_key: &str) -> Result<String, KeyDirError> {
        if !is_valid_key_format(presented_key) {
            return Err(KeyDirError::UnknownKey);
        }

        let cache_key = fast_hash(presented_key);

        {
            let cache = self.cache.read().await;
            match cache.get(&cache_key) {
                Some(CacheEntry::Valid(project_id)) => return Ok(project_id.clone()),
                Some(CacheEntry::Invalid { expires_at }) if *expires_at > Instant::now() => {
                    return Err(KeyDirError::UnknownKey);
                }
                _ => {}
            }
        }

        let resolved = self.verify_slow(presented_key).await?;

        let mut cache = self.cache.write().await;
        if cache.len() < MAX_CACHE_ENTRIES {
            let entry = match &resolved {
                Some(project_id) => CacheEntry::Valid(project_id.clone()),
                None => CacheEntry::Invalid {
                    expires_at: Instant::now() + NEGATIVE_TTL,
                },
            };
            cache.insert(cache_key, entry);
        }

        resolved.ok_or(KeyDirError::UnknownKey)
    }

    /// Verify the key against every project's stored verifier.
    async fn verify_slow(&self, presented_key: &str) -> Result<Option<String>, KeyDirError> {
        let keys = self.store.lookup_all_project_keys().await?;
        let argon2 = Argon2::default();

        for project in keys {
            let parsed = match PasswordHash::new(&project.verifier_hash) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(
                        project_id = %project.project_id,
                        error = %e,
                        "skipping project with unparseable verifier hash"
                    );
                    continue;
                }
            };
            if argon2
                .verify_password(presented_key.as_bytes(), &parsed)
                .is_ok()
            {
                tracing::debug!(project_id = %project.project_id, "api key verified");
                return Ok(Some(project.project_id));
            }
        }
        Ok(None)
    }
}
