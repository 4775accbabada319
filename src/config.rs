//! Unified configuration for the ForgeGuard build engine.
//!
//! Reads `forgeguard.toml` from the project root (when present), then lets
//! environment variables override individual knobs. Every field has a
//! sensible default so the engine runs with nothing but an API key.
//!
//! # Configuration File Format
//!
//! ```toml
//! [llm]
//! builder_model = "claude-opus-4-20250514"
//! planner_model = "claude-sonnet-4-20250514"
//! input_tpm = 80000
//! output_tpm = 16000
//!
//! [budget]
//! max_cost_usd = 25.0
//! warn_pct = 80
//! ticker_interval_secs = 15
//!
//! [build]
//! pause_threshold = 3
//! tier_concurrency = 3
//! handoff_timeout_secs = 600
//!
//! [audit]
//! trivial_file_max_chars = 50
//!
//! [clarification]
//! max_per_build = 10
//! timeout_secs = 600
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// LLM endpoint and model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API keys for the streaming endpoint. Multiple keys rotate through
    /// the rate-limit pool for ~N× throughput.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Model used by Coder and Fixer sub-agents (Opus class).
    #[serde(default = "default_builder_model")]
    pub builder_model: String,
    /// Model used by the planner, Scout, and Auditor (Sonnet class).
    #[serde(default = "default_planner_model")]
    pub planner_model: String,
    /// Per-key input tokens-per-minute budget.
    #[serde(default = "default_input_tpm")]
    pub input_tpm: u64,
    /// Per-key output tokens-per-minute budget.
    #[serde(default = "default_output_tpm")]
    pub output_tpm: u64,
    /// Max tokens per sub-agent response.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Extended-thinking budget for the planner (0 disables).
    #[serde(default)]
    pub thinking_budget: u32,
}

fn default_builder_model() -> String {
    "claude-opus-4-20250514".to_string()
}

fn default_planner_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_input_tpm() -> u64 {
    80_000
}

fn default_output_tpm() -> u64 {
    16_000
}

fn default_max_tokens() -> u32 {
    16_384
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            builder_model: default_builder_model(),
            planner_model: default_planner_model(),
            input_tpm: default_input_tpm(),
            output_tpm: default_output_tpm(),
            max_tokens: default_max_tokens(),
            thinking_budget: 0,
        }
    }
}

/// Spend cap and cost ticker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Server-side spend cap in USD. 0 disables the cap.
    #[serde(default = "default_max_cost")]
    pub max_cost_usd: f64,
    /// Percentage of the cap at which a one-time warning fires.
    #[serde(default = "default_warn_pct")]
    pub warn_pct: u8,
    /// Minimum seconds between cost_ticker events.
    #[serde(default = "default_ticker_interval")]
    pub ticker_interval_secs: u64,
}

fn default_max_cost() -> f64 {
    25.0
}

fn default_warn_pct() -> u8 {
    80
}

fn default_ticker_interval() -> u64 {
    15
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_cost_usd: default_max_cost(),
            warn_pct: default_warn_pct(),
            ticker_interval_secs: default_ticker_interval(),
        }
    }
}

/// Build loop behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Consecutive audit/governance failures before the build pauses.
    #[serde(default = "default_pause_threshold")]
    pub pause_threshold: u32,
    /// Max concurrent file pipelines within one tier.
    #[serde(default = "default_tier_concurrency")]
    pub tier_concurrency: usize,
    /// Per-handoff timeout in seconds.
    #[serde(default = "default_handoff_timeout")]
    pub handoff_timeout_secs: u64,
    /// Max tool-use rounds per sub-agent session.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Max planner iterations per phase.
    #[serde(default = "default_max_planner_iterations")]
    pub max_planner_iterations: u32,
}

fn default_pause_threshold() -> u32 {
    3
}

fn default_tier_concurrency() -> usize {
    3
}

fn default_handoff_timeout() -> u64 {
    600
}

fn default_max_tool_rounds() -> u32 {
    25
}

fn default_max_planner_iterations() -> u32 {
    20
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            pause_threshold: default_pause_threshold(),
            tier_concurrency: default_tier_concurrency(),
            handoff_timeout_secs: default_handoff_timeout(),
            max_tool_rounds: default_max_tool_rounds(),
            max_planner_iterations: default_max_planner_iterations(),
        }
    }
}

/// Batch-audit tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Files at or under this many characters bypass the batch auditor.
    #[serde(default = "default_trivial_chars")]
    pub trivial_file_max_chars: usize,
}

fn default_trivial_chars() -> usize {
    50
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            trivial_file_max_chars: default_trivial_chars(),
        }
    }
}

/// Clarification gate limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationConfig {
    /// Max clarification questions per build.
    #[serde(default = "default_clarification_max")]
    pub max_per_build: u32,
    /// Seconds to wait for an answer before the sentinel reply.
    #[serde(default = "default_clarification_timeout")]
    pub timeout_secs: u64,
}

fn default_clarification_max() -> u32 {
    10
}

fn default_clarification_timeout() -> u64 {
    600
}

impl Default for ClarificationConfig {
    fn default() -> Self {
        Self {
            max_per_build: default_clarification_max(),
            timeout_secs: default_clarification_timeout(),
        }
    }
}

/// Watchdog thresholds. The heartbeat interval and stall windows are
/// deliberately configurable so tests can compress them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_stall_warn")]
    pub stall_warn_secs: u64,
    #[serde(default = "default_stall_fail")]
    pub stall_fail_secs: u64,
}

fn default_heartbeat() -> u64 {
    45
}

fn default_stall_warn() -> u64 {
    300
}

fn default_stall_fail() -> u64 {
    900
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat(),
            stall_warn_secs: default_stall_warn(),
            stall_fail_secs: default_stall_fail(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub clarification: ClarificationConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

impl ForgeConfig {
    /// Load configuration: file (if present) → environment overrides.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut config = Self::load_file(project_dir)?;
        config.apply_env();
        Ok(config)
    }

    fn load_file(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join("forgeguard.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply environment variable overrides on top of file settings.
    pub fn apply_env(&mut self) {
        if let Ok(keys) = std::env::var("FORGEGUARD_API_KEYS") {
            let parsed: Vec<String> = keys
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.llm.api_keys = parsed;
            }
        }
        if let Ok(model) = std::env::var("FORGEGUARD_BUILDER_MODEL") {
            self.llm.builder_model = model;
        }
        if let Ok(model) = std::env::var("FORGEGUARD_PLANNER_MODEL") {
            self.llm.planner_model = model;
        }
        if let Ok(cap) = std::env::var("FORGEGUARD_MAX_COST_USD")
            && let Ok(v) = cap.parse::<f64>()
        {
            self.budget.max_cost_usd = v;
        }
        if let Ok(threshold) = std::env::var("FORGEGUARD_PAUSE_THRESHOLD")
            && let Ok(v) = threshold.parse::<u32>()
        {
            self.build.pause_threshold = v;
        }
        if let Ok(tpm) = std::env::var("FORGEGUARD_INPUT_TPM")
            && let Ok(v) = tpm.parse::<u64>()
        {
            self.llm.input_tpm = v;
        }
        if let Ok(tpm) = std::env::var("FORGEGUARD_OUTPUT_TPM")
            && let Ok(v) = tpm.parse::<u64>()
        {
            self.llm.output_tpm = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ForgeConfig::default();
        assert_eq!(config.build.pause_threshold, 3);
        assert_eq!(config.build.tier_concurrency, 3);
        assert_eq!(config.budget.warn_pct, 80);
        assert_eq!(config.llm.input_tpm, 80_000);
        assert_eq!(config.llm.output_tpm, 16_000);
        assert_eq!(config.clarification.max_per_build, 10);
        assert_eq!(config.watchdog.stall_fail_secs, 900);
        assert_eq!(config.audit.trivial_file_max_chars, 50);
    }

    #[test]
    fn test_parse_partial_toml() {
        let raw = r#"
[budget]
max_cost_usd = 5.0

[build]
pause_threshold = 2
"#;
        let config: ForgeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.budget.max_cost_usd, 5.0);
        assert_eq!(config.build.pause_threshold, 2);
        // Untouched sections keep defaults
        assert_eq!(config.budget.warn_pct, 80);
        assert_eq!(config.llm.max_tokens, 16_384);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ForgeConfig::load(dir.path()).unwrap();
        assert_eq!(config.build.pause_threshold, 3);
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("forgeguard.toml"),
            "[llm]\nbuilder_model = \"claude-opus-4-test\"\n",
        )
        .unwrap();
        let config = ForgeConfig::load(dir.path()).unwrap();
        assert_eq!(config.llm.builder_model, "claude-opus-4-test");
    }
}
