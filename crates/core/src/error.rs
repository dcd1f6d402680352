use thiserror::Error;

use crate::scope::UnknownScope;

/// Startup configuration failures. Any of these is fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}' as {expected}")]
    Parse {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("{key}: {source}")]
    Scope {
        key: String,
        #[source]
        source: UnknownScope,
    },

    #[error("API_KEYS entry '{0}' must look like key:scope,scope[:max_concurrency]")]
    ApiKeyEntry(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
