use qaguardian_core::Scope;
use std::collections::HashMap;

use crate::tool::ToolDefinition;

/// Name prefixes that mark a tool as read-only.
const READ_PREFIXES: &[&str] = &["get_", "list_", "search_", "describe_", "read_"];
/// Name prefixes that start or stop work on the backend.
const EXECUTE_PREFIXES: &[&str] = &["run_", "cancel_", "execute_", "rerun_", "trigger_"];
/// Name prefixes that reconfigure the server itself.
const ADMIN_PREFIXES: &[&str] = &["switch_", "set_provider"];

/// Decides which scope a tool call requires.
///
/// Resolution order: explicit rule (exact name, then `prefix*` glob), the
/// scope declared on the tool definition, then inference from the name.
#[derive(Debug, Clone, Default)]
pub struct ScopePolicy {
    /// Explicit per-tool overrides
    pub rules: HashMap<String, Scope>,
}

impl ScopePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, pattern: impl Into<String>, scope: Scope) -> Self {
        self.rules.insert(pattern.into(), scope);
        self
    }

    /// Get the scope required to invoke `def`.
    pub fn scope_for(&self, def: &ToolDefinition) -> Scope {
        if let Some(&scope) = self.rules.get(&def.name) {
            return scope;
        }
        // Longest matching glob wins so "get_secret*" can tighten "get_*".
        let glob = self
            .rules
            .iter()
            .filter_map(|(pattern, &scope)| {
                let prefix = pattern.strip_suffix('*')?;
                def.name.starts_with(prefix).then_some((prefix.len(), scope))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, scope)) = glob {
            return scope;
        }
        def.required_scope.unwrap_or_else(|| infer_scope(&def.name))
    }
}

/// Infer a tool's scope from its name alone.
pub fn infer_scope(tool_name: &str) -> Scope {
    let starts = |prefixes: &[&str]| prefixes.iter().any(|p| tool_name.starts_with(p));
    if starts(ADMIN_PREFIXES) {
        Scope::Admin
    } else if starts(EXECUTE_PREFIXES) {
        Scope::Execute
    } else if starts(READ_PREFIXES) {
        Scope::Read
    } else {
        Scope::Write
    }
}
