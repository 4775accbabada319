//! Typed error hierarchy for the ForgeGuard build engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `BuildError` — conductor, planner, and tier-executor failures
//! - `LlmError` — streaming client and rate-limit pool failures
//! - `ToolError` — sandboxed tool execution failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the build conductor and its sub-executors.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Cost cap exceeded: ${spent} >= ${cap}")]
    CostCapExceeded { spent: String, cap: String },

    #[error("Build cancelled by user")]
    Cancelled,

    #[error("Build stalled: no progress for {idle_secs}s while {activity}")]
    Stalled { idle_secs: u64, activity: String },

    #[error("Phase planner failed for phase {phase}: {reason}")]
    PlanningFailed { phase: u32, reason: String },

    #[error("Plan rejected by user{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    PlanRejected { reason: Option<String> },

    #[error("Contract '{contract_type}' not found for project")]
    ContractMissing { contract_type: String },

    #[error("Phases contract contains no phases")]
    EmptyPhasesContract,

    #[error("Failed to write manifest cache at {path}: {source}")]
    ManifestCacheWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Governance gate blocked phase {phase}: {failures} failing check(s)")]
    GovernanceBlocked { phase: String, failures: usize },

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the streaming LLM client and key pool.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("API returned {status}{}", retry_after.map(|s| format!(" (retry-after {s}s)")).unwrap_or_default())]
    Http {
        status: u16,
        retry_after: Option<u64>,
        body: String,
    },

    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Stream decode error: {0}")]
    Decode(String),

    #[error("Stream cancelled")]
    Cancelled,

    #[error("Empty response from endpoint")]
    EmptyResponse,
}

impl LlmError {
    /// Whether this error should be retried with back-off.
    /// Mirrors the retryable status set {429, 500, 502, 503, 529}
    /// plus request timeouts.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 529),
            LlmError::Timeout => true,
            _ => false,
        }
    }
}

/// Errors from sandboxed tool execution.
///
/// These are *returned to the model* as error-text tool results, never
/// propagated to the conductor — a failed tool call is information for
/// the agent, not a build failure.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Access denied: path is outside the project directory")]
    OutsideWorkspace,

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("{0} is a directory — use list_directory")]
    IsDirectory(String),

    #[error("{0} is not a directory — use read_file")]
    NotADirectory(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool '{tool}' is not available to the {role} role")]
    Disallowed { tool: String, role: String },

    #[error("Command rejected: {0}")]
    CommandDenied(String),

    #[error("Command timed out after {0}s")]
    CommandTimeout(u64),

    #[error("Edit failed: {0}")]
    EditFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Clarification limit reached ({0} per build)")]
    ClarificationLimit(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
