use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::scope::ScopeSet;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Profiled key lookup over an arbitrary source of variables.
///
/// With a non-empty profile, `{PROFILE}_{KEY}` is tried before `{KEY}`.
/// Empty values count as unset.
struct Vars<'a> {
    profile: &'a str,
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    fn opt(&self, key: &str) -> Option<String> {
        if !self.profile.is_empty() {
            let prefixed = format!("{}_{}", self.profile, key);
            if let Some(v) = (self.lookup)(&prefixed).filter(|s| !s.is_empty()) {
                return Some(v);
            }
        }
        (self.lookup)(key).filter(|s| !s.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.opt(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T, expected: &'static str) -> Result<T, ConfigError> {
        match self.opt(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Parse {
                key: key.to_string(),
                value: raw,
                expected,
            }),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.opt(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Parse {
                    key: key.to_string(),
                    value: v,
                    expected: "a boolean",
                }),
            },
        }
    }

    fn millis(&self, key: &str, default_ms: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default_ms, "milliseconds").map(Duration::from_millis)
    }

    fn secs(&self, key: &str, default_secs: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default_secs, "seconds").map(Duration::from_secs)
    }

    fn scopes(&self, key: &str, default: &str) -> Result<ScopeSet, ConfigError> {
        ScopeSet::parse(&self.or(key, default)).map_err(|source| ConfigError::Scope {
            key: key.to_string(),
            source,
        })
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub admission: AdmissionConfig,
    pub streaming: StreamConfig,
    pub idempotency: IdempotencyConfig,
    pub session: SessionConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `QAG_PROFILE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = env::var("QAG_PROFILE").unwrap_or_default().to_uppercase();
        Self::from_lookup(&profile, &|key: &str| env::var(key).ok())
    }

    /// Build config from any key lookup, e.g. a map in tests.
    pub fn from_lookup(profile: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let p = profile.to_uppercase();
        let vars = Vars { profile: &p, lookup };
        let config = Self {
            profile: p.clone(),
            server: ServerConfig::from_vars(&vars)?,
            auth: AuthConfig::from_vars(&vars)?,
            admission: AdmissionConfig::from_vars(&vars)?,
            streaming: StreamConfig::from_vars(&vars)?,
            idempotency: IdempotencyConfig::from_vars(&vars)?,
            session: SessionConfig::from_vars(&vars)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admission.max_concurrency == 0 {
            return Err(ConfigError::Invalid("MAX_CONCURRENCY must be at least 1".into()));
        }
        if self.streaming.chunk_size == 0 {
            return Err(ConfigError::Invalid("STREAM_CHUNK_SIZE must be at least 1".into()));
        }
        if self.streaming.threshold == 0 {
            return Err(ConfigError::Invalid("STREAM_THRESHOLD must be at least 1".into()));
        }
        if self.idempotency.capacity == 0 {
            return Err(ConfigError::Invalid("IDEMPOTENCY_CAPACITY must be at least 1".into()));
        }
        if self.session.ping_interval.is_zero() {
            return Err(ConfigError::Invalid("PING_INTERVAL_MS must be positive".into()));
        }
        if self.session.connection_timeout <= self.session.ping_interval {
            return Err(ConfigError::Invalid(
                "CONNECTION_TIMEOUT_MS must exceed PING_INTERVAL_MS".into(),
            ));
        }
        if self.auth.require_auth && self.auth.api_key.is_none() && self.auth.api_keys.is_empty() {
            tracing::warn!("REQUIRE_AUTH is set but no API keys are configured; every call will be rejected");
        }
        Ok(())
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:      {}:{}", self.server.host, self.server.port);
        tracing::info!(
            "  auth:        require_auth={}, api_key={}, extra_keys={}",
            self.auth.require_auth,
            if self.auth.api_key.is_some() { "set" } else { "(none)" },
            self.auth.api_keys.len()
        );
        tracing::info!(
            "  admission:   max_concurrency={}, queue_timeout={:?}",
            self.admission.max_concurrency, self.admission.queue_timeout
        );
        tracing::info!(
            "  streaming:   threshold={}, chunk_size={}",
            self.streaming.threshold, self.streaming.chunk_size
        );
        tracing::info!(
            "  idempotency: ttl={:?}, capacity={}",
            self.idempotency.ttl, self.idempotency.capacity
        );
        tracing::info!(
            "  session:     ping={:?}, timeout={:?}, resume_window={:?}",
            self.session.ping_interval, self.session.connection_timeout, self.session.resume_window
        );
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

impl ServerConfig {
    fn from_vars(v: &Vars<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            host: v.or("HOST", "0.0.0.0"),
            port: v.parse("PORT", 3100, "a port number")?,
            cors_origin: v.or("CORS_ORIGIN", "*"),
        })
    }
}

// ── Auth ──────────────────────────────────────────────────────

/// One statically configured credential.
#[derive(Clone)]
pub struct ApiKeyEntry {
    pub key: String,
    pub scopes: ScopeSet,
    pub max_concurrency: Option<usize>,
}

impl fmt::Debug for ApiKeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyEntry")
            .field("key", &"********")
            .field("scopes", &self.scopes)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

impl FromStr for ApiKeyEntry {
    type Err = ConfigError;

    /// `key:scope,scope[:max]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ConfigError::ApiKeyEntry(redact(s));
        let mut parts = s.trim().split(':');
        let key = parts.next().filter(|k| !k.is_empty()).ok_or_else(malformed)?;

        // Scope tokens themselves contain ':' (mcp:read), so re-join the middle
        // and peel an optional numeric suffix off the end.
        let rest: Vec<&str> = parts.collect();
        let (scope_parts, max) = match rest.split_last() {
            Some((last, head)) if !head.is_empty() && last.chars().all(|c| c.is_ascii_digit()) && !last.is_empty() => {
                (head.to_vec(), Some(last.parse::<usize>().map_err(|_| malformed())?))
            }
            _ => (rest, None),
        };
        if scope_parts.is_empty() {
            return Err(malformed());
        }
        let scopes = ScopeSet::parse(&scope_parts.join(":")).map_err(|source| ConfigError::Scope {
            key: "API_KEYS".to_string(),
            source,
        })?;
        if scopes.is_empty() || max == Some(0) {
            return Err(malformed());
        }
        Ok(Self {
            key: key.to_string(),
            scopes,
            max_concurrency: max,
        })
    }
}

fn redact(entry: &str) -> String {
    match entry.split_once(':') {
        Some((_, rest)) => format!("****:{}", rest),
        None => "****".to_string(),
    }
}

/// Parse the `API_KEYS` list (entries separated by `;`).
pub fn parse_api_keys(raw: &str) -> Result<Vec<ApiKeyEntry>, ConfigError> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ApiKeyEntry::from_str)
        .collect()
}

#[derive(Clone)]
pub struct AuthConfig {
    pub require_auth: bool,
    /// Key used for stdio requests and SSE requests without credentials.
    pub api_key: Option<String>,
    pub api_key_scopes: ScopeSet,
    pub api_keys: Vec<ApiKeyEntry>,
    pub anonymous_scopes: ScopeSet,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("require_auth", &self.require_auth)
            .field("api_key", &self.api_key.as_ref().map(|_| "********"))
            .field("api_key_scopes", &self.api_key_scopes)
            .field("api_keys", &self.api_keys)
            .field("anonymous_scopes", &self.anonymous_scopes)
            .finish()
    }
}

impl AuthConfig {
    fn from_vars(v: &Vars<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            require_auth: v.flag("REQUIRE_AUTH", false)?,
            api_key: v.opt("API_KEY"),
            api_key_scopes: v.scopes("API_KEY_SCOPES", "mcp")?,
            api_keys: v.opt("API_KEYS").map(|raw| parse_api_keys(&raw)).transpose()?.unwrap_or_default(),
            anonymous_scopes: v.scopes("ANONYMOUS_SCOPES", "mcp")?,
        })
    }
}

// ── Admission ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Default per-identity concurrency limit.
    pub max_concurrency: usize,
    pub queue_timeout: Duration,
}

impl AdmissionConfig {
    fn from_vars(v: &Vars<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            max_concurrency: v.parse("MAX_CONCURRENCY", 5, "a positive integer")?,
            queue_timeout: v.millis("QUEUE_TIMEOUT_MS", 30_000)?,
        })
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

// ── Streaming ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Item count at or above which results are chunked.
    pub threshold: usize,
    pub chunk_size: usize,
}

impl StreamConfig {
    fn from_vars(v: &Vars<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            threshold: v.parse("STREAM_THRESHOLD", 5, "a positive integer")?,
            chunk_size: v.parse("STREAM_CHUNK_SIZE", 3, "a positive integer")?,
        })
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { threshold: 5, chunk_size: 3 }
    }
}

// ── Idempotency ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

impl IdempotencyConfig {
    fn from_vars(v: &Vars<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            ttl: v.secs("IDEMPOTENCY_TTL_SECS", 1800)?,
            capacity: v.parse("IDEMPOTENCY_CAPACITY", 1024, "a positive integer")?,
        })
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(1800),
            capacity: 1024,
        }
    }
}

// ── SSE sessions ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ping_interval: Duration,
    pub connection_timeout: Duration,
    /// How long a disconnected session may still be resumed.
    pub resume_window: Duration,
    /// Recent events kept per session for replay after resume.
    pub buffer_size: usize,
}

impl SessionConfig {
    fn from_vars(v: &Vars<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            ping_interval: v.millis("PING_INTERVAL_MS", 30_000)?,
            connection_timeout: v.millis("CONNECTION_TIMEOUT_MS", 120_000)?,
            resume_window: v.secs("SESSION_RESUME_WINDOW_SECS", 300)?,
            buffer_size: v.parse("SESSION_BUFFER_SIZE", 256, "a positive integer")?,
        })
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(120),
            resume_window: Duration::from_secs(300),
            buffer_size: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)], profile: &str) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(profile, &move |key: &str| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[], "").unwrap();
        assert!(!config.auth.require_auth);
        assert_eq!(config.admission.max_concurrency, 5);
        assert_eq!(config.admission.queue_timeout, Duration::from_secs(30));
        assert_eq!(config.streaming.threshold, 5);
        assert_eq!(config.streaming.chunk_size, 3);
        assert_eq!(config.server.port, 3100);
        assert!(config.auth.anonymous_scopes.allows(Scope::Admin));
        assert_eq!(config.profile_label(), "default");
    }

    #[test]
    fn test_profile_prefix_wins() {
        let config = config_from(&[("MAX_CONCURRENCY", "2"), ("PROD_MAX_CONCURRENCY", "9")], "prod").unwrap();
        assert_eq!(config.profile, "PROD");
        assert_eq!(config.admission.max_concurrency, 9);
    }

    #[test]
    fn test_malformed_number_is_fatal() {
        let err = config_from(&[("QUEUE_TIMEOUT_MS", "soon")], "").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref key, .. } if key == "QUEUE_TIMEOUT_MS"));
    }

    #[test]
    fn test_malformed_flag_is_fatal() {
        assert!(config_from(&[("REQUIRE_AUTH", "maybe")], "").is_err());
        let config = config_from(&[("REQUIRE_AUTH", "TRUE")], "").unwrap();
        assert!(config.auth.require_auth);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let err = config_from(&[("STREAM_CHUNK_SIZE", "0")], "").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_timeout_must_exceed_ping() {
        let err = config_from(&[("PING_INTERVAL_MS", "5000"), ("CONNECTION_TIMEOUT_MS", "5000")], "").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_parse_api_keys() {
        let keys = parse_api_keys("k1:mcp:read; k2:mcp:read,mcp:execute:2 ;k3:admin").unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0].key, "k1");
        assert!(keys[0].scopes.allows(Scope::Read));
        assert!(!keys[0].scopes.allows(Scope::Execute));
        assert_eq!(keys[0].max_concurrency, None);
        assert!(keys[1].scopes.allows(Scope::Execute));
        assert_eq!(keys[1].max_concurrency, Some(2));
        assert!(keys[2].scopes.allows(Scope::Write));
    }

    #[test]
    fn test_parse_api_keys_rejects_missing_scopes() {
        let err = parse_api_keys("lonely-key").unwrap_err();
        assert!(matches!(err, ConfigError::ApiKeyEntry(_)));
        // The secret never appears in the error text.
        let err = parse_api_keys("s3cret:").unwrap_err();
        assert!(!err.to_string().contains("s3cret"));
    }

    #[test]
    fn test_debug_redacts_keys() {
        let config = config_from(&[("API_KEY", "top-secret"), ("API_KEYS", "other-secret:mcp")], "").unwrap();
        let dump = format!("{:?}", config);
        assert!(!dump.contains("top-secret"));
        assert!(!dump.contains("other-secret"));
    }
}
