//! Scope model shared by the auth gate, the tool policy and configuration.
//!
//! A tool *requires* exactly one [`Scope`]. A credential is *granted* a
//! [`ScopeSet`] of [`GrantedScope`] tokens, where `mcp` and `admin` imply
//! every other scope.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Scope a tool requires before it may be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Read,
    Write,
    Execute,
    Admin,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Read => "read",
            Scope::Write => "write",
            Scope::Execute => "execute",
            Scope::Admin => "admin",
        }
    }

    /// The credential token that grants exactly this scope.
    pub fn granting_token(&self) -> &'static str {
        match self {
            Scope::Read => "mcp:read",
            Scope::Write => "mcp:write",
            Scope::Execute => "mcp:execute",
            Scope::Admin => "admin",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scope token as granted to a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GrantedScope {
    #[serde(rename = "mcp")]
    Mcp,
    #[serde(rename = "mcp:read")]
    Read,
    #[serde(rename = "mcp:write")]
    Write,
    #[serde(rename = "mcp:execute")]
    Execute,
    #[serde(rename = "admin")]
    Admin,
}

/// Every token a credential may carry, in documentation order.
pub const ACCEPTED_SCOPES: &[&str] = &["mcp", "mcp:read", "mcp:write", "mcp:execute", "admin"];

impl GrantedScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantedScope::Mcp => "mcp",
            GrantedScope::Read => "mcp:read",
            GrantedScope::Write => "mcp:write",
            GrantedScope::Execute => "mcp:execute",
            GrantedScope::Admin => "admin",
        }
    }

    /// Whether holding this token satisfies `required`.
    pub fn allows(&self, required: Scope) -> bool {
        match self {
            GrantedScope::Mcp | GrantedScope::Admin => true,
            GrantedScope::Read => required == Scope::Read,
            GrantedScope::Write => required == Scope::Write,
            GrantedScope::Execute => required == Scope::Execute,
        }
    }
}

impl fmt::Display for GrantedScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown scope '{0}' (accepted: mcp, mcp:read, mcp:write, mcp:execute, admin)")]
pub struct UnknownScope(pub String);

impl FromStr for GrantedScope {
    type Err = UnknownScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Bare names are accepted as shorthand for the `mcp:` form.
        match s.trim().to_ascii_lowercase().as_str() {
            "mcp" => Ok(GrantedScope::Mcp),
            "mcp:read" | "read" => Ok(GrantedScope::Read),
            "mcp:write" | "write" => Ok(GrantedScope::Write),
            "mcp:execute" | "execute" => Ok(GrantedScope::Execute),
            "admin" => Ok(GrantedScope::Admin),
            other => Err(UnknownScope(other.to_string())),
        }
    }
}

/// Ordered set of scope tokens held by one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSet(BTreeSet<GrantedScope>);

impl ScopeSet {
    pub fn new(scopes: impl IntoIterator<Item = GrantedScope>) -> Self {
        Self(scopes.into_iter().collect())
    }

    /// The all-access set (`mcp`).
    pub fn full() -> Self {
        Self::new([GrantedScope::Mcp])
    }

    /// Parse a comma- or whitespace-separated list such as `"mcp:read, mcp:write"`.
    pub fn parse(list: &str) -> Result<Self, UnknownScope> {
        list.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(GrantedScope::from_str)
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }

    pub fn allows(&self, required: Scope) -> bool {
        self.0.iter().any(|granted| granted.allows(required))
    }

    pub fn insert(&mut self, scope: GrantedScope) {
        self.0.insert(scope);
    }

    pub fn iter(&self) -> impl Iterator<Item = &GrantedScope> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|s| s.as_str().to_string()).collect()
    }
}
