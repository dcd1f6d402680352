//! Auth gate: resolves the caller's credential to an [`Identity`] and checks
//! the scope a tool requires.
//!
//! Keys never leave this module in clear text. Identities, logs and cache
//! keys only carry the SHA-256 hash.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use qaguardian_core::config::AuthConfig;
use qaguardian_core::{Scope, ScopeSet};
use sha2::{Digest, Sha256};

use crate::error::McpError;

/// Identity key used when auth is not required and no key was supplied.
pub const ANONYMOUS: &str = "anonymous";

const MAX_KEY_LEN: usize = 512;

/// The caller a request runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// SHA-256 of the API key, or [`ANONYMOUS`].
    pub key_hash: String,
    pub scopes: ScopeSet,
    pub max_concurrency: usize,
}

impl Identity {
    pub fn is_anonymous(&self) -> bool {
        self.key_hash == ANONYMOUS
    }

    /// Short prefix of the key hash, safe for logs.
    pub fn short_hash(&self) -> &str {
        &self.key_hash[..self.key_hash.len().min(12)]
    }
}

/// What a key lookup yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub scopes: ScopeSet,
    /// Overrides the server-wide concurrency default for this key.
    pub max_concurrency: Option<usize>,
}

/// Looks up an API key. Implementations may perform network I/O.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    /// `Ok(None)` means the key is unknown.
    async fn resolve(&self, api_key: &str) -> Result<Option<KeyRecord>, McpError>;
}

/// Hex SHA-256 of an API key.
pub fn hash_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

/// In-process key table, keyed by hash. Entries can be changed at runtime.
#[derive(Default)]
pub struct StaticKeyResolver {
    keys: RwLock<HashMap<String, KeyRecord>>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from `API_KEY` / `API_KEYS` configuration.
    pub fn from_config(config: &AuthConfig) -> Self {
        let resolver = Self::new();
        if let Some(key) = &config.api_key {
            resolver.insert(
                key,
                KeyRecord {
                    scopes: config.api_key_scopes.clone(),
                    max_concurrency: None,
                },
            );
        }
        for entry in &config.api_keys {
            resolver.insert(
                &entry.key,
                KeyRecord {
                    scopes: entry.scopes.clone(),
                    max_concurrency: entry.max_concurrency,
                },
            );
        }
        resolver
    }

    /// Add or replace a key.
    pub fn insert(&self, api_key: &str, record: KeyRecord) {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        keys.insert(hash_key(api_key), record);
    }

    pub fn remove(&self, api_key: &str) -> bool {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        keys.remove(&hash_key(api_key)).is_some()
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyResolver for StaticKeyResolver {
    async fn resolve(&self, api_key: &str) -> Result<Option<KeyRecord>, McpError> {
        let keys = self.keys.read().unwrap_or_else(|e| e.into_inner());
        Ok(keys.get(&hash_key(api_key)).cloned())
    }
}

/// Stateless credential and scope check run before anything else.
pub struct AuthGate {
    require_auth: bool,
    resolver: Arc<dyn KeyResolver>,
    anonymous_scopes: ScopeSet,
    default_max_concurrency: usize,
}

impl AuthGate {
    pub fn new(require_auth: bool, resolver: Arc<dyn KeyResolver>, default_max_concurrency: usize) -> Self {
        Self {
            require_auth,
            resolver,
            anonymous_scopes: ScopeSet::full(),
            default_max_concurrency,
        }
    }

    pub fn with_anonymous_scopes(mut self, scopes: ScopeSet) -> Self {
        self.anonymous_scopes = scopes;
        self
    }

    /// Resolve the supplied key (if any) to an identity.
    pub async fn authenticate(&self, api_key: Option<&str>) -> Result<Identity, McpError> {
        let api_key = api_key.map(str::trim).filter(|k| !k.is_empty());

        let Some(api_key) = api_key else {
            if self.require_auth {
                tracing::warn!("Rejected call without API key");
                return Err(McpError::AuthenticationRequired);
            }
            return Ok(Identity {
                key_hash: ANONYMOUS.to_string(),
                scopes: self.anonymous_scopes.clone(),
                max_concurrency: self.default_max_concurrency,
            });
        };

        if is_malformed(api_key) {
            tracing::warn!("Rejected malformed API key");
            return Err(McpError::InvalidApiKey);
        }

        let key_hash = hash_key(api_key);
        match self.resolver.resolve(api_key).await? {
            Some(record) => Ok(Identity {
                max_concurrency: record.max_concurrency.unwrap_or(self.default_max_concurrency),
                scopes: record.scopes,
                key_hash,
            }),
            None => {
                tracing::warn!(key = %&key_hash[..12], "Rejected unknown API key");
                Err(McpError::InvalidApiKey)
            }
        }
    }

    /// Check that `identity` may invoke `tool`, which requires `required`.
    pub fn authorize(&self, identity: &Identity, tool: &str, required: Scope) -> Result<(), McpError> {
        if identity.scopes.allows(required) {
            return Ok(());
        }
        tracing::info!(
            key = %identity.short_hash(),
            tool = %tool,
            required = %required,
            "Insufficient scope"
        );
        Err(McpError::InsufficientScope {
            tool: tool.to_string(),
            required,
            granted: identity.scopes.clone(),
        })
    }
}

fn is_malformed(api_key: &str) -> bool {
    api_key.len() > MAX_KEY_LEN || api_key.chars().any(|c| c.is_whitespace() || c.is_control())
}
