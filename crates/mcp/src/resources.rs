//! Resource URI catalog.
//!
//! Resources are addressed as `qaguardian://<path>`. Parsing is strict: a URI
//! that breaks the grammar is reported with the documented format and a few
//! valid examples, a well-formed URI that matches no pattern is reported with
//! the pattern list. Neither error ever lists real resources.

use async_trait::async_trait;
use qaguardian_tool_runtime::ToolContext;

use crate::error::McpError;
use crate::types::{ResourceContents, ResourceInfo, ResourceTemplate};

pub const SCHEME: &str = "qaguardian://";

pub const URI_FORMAT: &str = "qaguardian://<collection>[/<id>[/<sub-collection>[/<id>]]]";

pub const EXAMPLE_URIS: &[&str] = &[
    "qaguardian://projects",
    "qaguardian://projects/42",
    "qaguardian://projects/42/suites",
    "qaguardian://runs/1337/results",
];

pub const RESOURCE_PATTERNS: &[&str] = &[
    "qaguardian://projects",
    "qaguardian://projects/{projectId}",
    "qaguardian://projects/{projectId}/suites",
    "qaguardian://projects/{projectId}/suites/{suiteId}",
    "qaguardian://projects/{projectId}/runs",
    "qaguardian://runs/{runId}",
    "qaguardian://runs/{runId}/results",
];

/// (name, description) for each entry of [`RESOURCE_PATTERNS`], same order.
const PATTERN_DOCS: &[(&str, &str)] = &[
    ("projects", "All projects visible to the caller"),
    ("project", "A single project"),
    ("project-suites", "Test suites of a project"),
    ("suite", "A single test suite"),
    ("project-runs", "Recent test runs of a project"),
    ("run", "A single test run"),
    ("run-results", "Per-test results of a run"),
];

const JSON_MIME: &str = "application/json";

/// What a parsed URI points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceTarget {
    Projects,
    Project { project_id: String },
    Suites { project_id: String },
    Suite { project_id: String, suite_id: String },
    ProjectRuns { project_id: String },
    Run { run_id: String },
    RunResults { run_id: String },
}

/// Parse a resource URI into its target.
pub fn parse(uri: &str) -> Result<ResourceTarget, McpError> {
    let invalid = |reason: &str| McpError::InvalidResourceUri {
        uri: uri.to_string(),
        reason: reason.to_string(),
    };

    let path = uri
        .strip_prefix(SCHEME)
        .ok_or_else(|| invalid("URI must start with qaguardian://"))?;
    if path.is_empty() {
        return Err(invalid("missing resource path"));
    }

    let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(invalid("empty path segment"));
    }
    if let Some(bad) = segments.iter().find(|s| !s.chars().all(is_segment_char)) {
        return Err(invalid(&format!("illegal characters in segment '{bad}'")));
    }

    let target = match segments.as_slice() {
        ["projects"] => ResourceTarget::Projects,
        ["projects", id] => ResourceTarget::Project { project_id: id.to_string() },
        ["projects", id, "suites"] => ResourceTarget::Suites { project_id: id.to_string() },
        ["projects", id, "suites", suite] => ResourceTarget::Suite {
            project_id: id.to_string(),
            suite_id: suite.to_string(),
        },
        ["projects", id, "runs"] => ResourceTarget::ProjectRuns { project_id: id.to_string() },
        ["runs", id] => ResourceTarget::Run { run_id: id.to_string() },
        ["runs", id, "results"] => ResourceTarget::RunResults { run_id: id.to_string() },
        _ => return Err(McpError::UnknownResource { uri: uri.to_string() }),
    };
    Ok(target)
}

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Templates advertised by `resources/templates/list`.
pub fn templates() -> Vec<ResourceTemplate> {
    RESOURCE_PATTERNS
        .iter()
        .zip(PATTERN_DOCS)
        .map(|(pattern, (name, description))| ResourceTemplate {
            uri_template: pattern.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            mime_type: JSON_MIME.to_string(),
        })
        .collect()
}

/// Backend that actually loads resources.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Concrete resources to advertise in `resources/list`.
    async fn list(&self, _context: &ToolContext) -> Result<Vec<ResourceInfo>, McpError> {
        Ok(Vec::new())
    }

    /// Load one resource. `Ok(None)` is a 404 from the backing API.
    async fn read(
        &self,
        uri: &str,
        target: &ResourceTarget,
        context: &ToolContext,
    ) -> Result<Option<ResourceContents>, McpError>;
}

/// Handler for deployments without a resource backend: every read is a miss.
pub struct NoResources;

#[async_trait]
impl ResourceHandler for NoResources {
    async fn read(
        &self,
        _uri: &str,
        _target: &ResourceTarget,
        _context: &ToolContext,
    ) -> Result<Option<ResourceContents>, McpError> {
        Ok(None)
    }
}
