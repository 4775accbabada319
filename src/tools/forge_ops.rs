//! Forge tools — contract pulls, the scratchpad, and clarification.
//!
//! These proxy to the engine's own state rather than the filesystem:
//! live contracts through the `ContractStore`, the pinned snapshot frozen
//! at build start, the per-build scratchpad, and the blocking
//! clarification bridge the conductor answers through its gate.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::contracts::ContractType;
use crate::errors::ToolError;
use crate::tools::ToolContext;

/// Scratchpad values are capped so one key cannot blow up tool results.
const MAX_SCRATCHPAD_VALUE: usize = 20_000;

pub async fn get_project_contract(input: &Value, ctx: &ToolContext) -> Result<String, ToolError> {
    let type_name = input
        .get("contract_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidInput("missing 'contract_type'".into()))?;
    let Some(contract_type) = ContractType::parse(type_name) else {
        return Err(ToolError::InvalidInput(format!(
            "unknown contract type '{type_name}'"
        )));
    };

    let contract = ctx
        .contracts
        .get_contract(ctx.project_id, contract_type)
        .await
        .map_err(|e| ToolError::InvalidInput(e.to_string()))?;

    match contract {
        Some(c) => Ok(json!({
            "contract_type": contract_type.as_str(),
            "version": c.version,
            "content": c.content,
        })
        .to_string()),
        None => Ok(json!({
            "contract_type": contract_type.as_str(),
            "content": Value::Null,
            "message": format!("No '{contract_type}' contract exists for this project."),
        })
        .to_string()),
    }
}

pub async fn list_project_contracts(ctx: &ToolContext) -> Result<String, ToolError> {
    let types = ctx
        .contracts
        .list_types(ctx.project_id)
        .await
        .map_err(|e| ToolError::InvalidInput(e.to_string()))?;
    let names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
    Ok(json!({"contract_types": names}).to_string())
}

/// The pinned snapshot — the only contract surface the Fixer sees.
pub fn get_build_contracts(ctx: &ToolContext) -> Result<String, ToolError> {
    if ctx.snapshot.is_empty() {
        return Ok(json!({
            "contracts": Value::Null,
            "message": "No pinned contract snapshot exists for this build.",
        })
        .to_string());
    }
    Ok(json!({
        "captured_at": ctx.snapshot.captured_at.to_rfc3339(),
        "contracts": ctx.snapshot.as_markdown(),
    })
    .to_string())
}

pub fn get_phase_window(input: &Value, ctx: &ToolContext) -> Result<String, ToolError> {
    let number = input
        .get("phase")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| ToolError::InvalidInput("missing 'phase'".into()))? as u32;
    match ctx.phases.iter().find(|p| p.number == number) {
        Some(phase) => {
            Ok(serde_json::to_string(phase).map_err(|e| ToolError::InvalidInput(e.to_string()))?)
        }
        None => Ok(json!({
            "phase": number,
            "message": format!("Phase {number} is not defined in the phases contract."),
        })
        .to_string()),
    }
}

// ---------------------------------------------------------------------------
// Scratchpad
// ---------------------------------------------------------------------------

/// Per-build key-value log shared by every sub-agent in the build.
/// Ordered keys keep `list` output stable.
#[derive(Default)]
pub struct Scratchpad {
    entries: Mutex<BTreeMap<String, String>>,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn write(&self, key: &str, value: &str) {
        let mut guard = self.entries.lock().await;
        guard.insert(key.to_string(), truncate(value));
    }

    pub async fn append(&self, key: &str, value: &str) {
        let mut guard = self.entries.lock().await;
        let entry = guard.entry(key.to_string()).or_default();
        if !entry.is_empty() {
            entry.push('\n');
        }
        entry.push_str(value);
        let capped = truncate(entry);
        *entry = capped;
    }

    pub async fn read(&self, key: &str) -> Option<String> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    /// Snapshot for `.forge/scratchpad.json` persistence.
    pub async fn to_json(&self) -> Value {
        let guard = self.entries.lock().await;
        json!(guard.clone())
    }
}

fn truncate(value: &str) -> String {
    if value.len() <= MAX_SCRATCHPAD_VALUE {
        return value.to_string();
    }
    let mut end = MAX_SCRATCHPAD_VALUE;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[... truncated ...]", &value[..end])
}

pub async fn scratchpad(input: &Value, ctx: &ToolContext) -> Result<String, ToolError> {
    let operation = input
        .get("operation")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_lowercase();
    let key = input.get("key").and_then(|v| v.as_str()).unwrap_or("");
    let value = input.get("value").and_then(|v| v.as_str()).unwrap_or("");

    match operation.as_str() {
        "write" => {
            if key.is_empty() {
                return Err(ToolError::InvalidInput("write requires 'key'".into()));
            }
            ctx.scratchpad.write(key, value).await;
            persist(ctx).await;
            Ok(json!({"operation": "write", "key": key, "stored": value.len()}).to_string())
        }
        "append" => {
            if key.is_empty() {
                return Err(ToolError::InvalidInput("append requires 'key'".into()));
            }
            ctx.scratchpad.append(key, value).await;
            persist(ctx).await;
            Ok(json!({"operation": "append", "key": key, "stored": value.len()}).to_string())
        }
        "read" => {
            if key.is_empty() {
                return Err(ToolError::InvalidInput("read requires 'key'".into()));
            }
            match ctx.scratchpad.read(key).await {
                Some(stored) => Ok(json!({"key": key, "value": stored}).to_string()),
                None => Ok(json!({"key": key, "value": Value::Null}).to_string()),
            }
        }
        "list" => {
            let keys = ctx.scratchpad.keys().await;
            Ok(json!({"keys": keys}).to_string())
        }
        other => Err(ToolError::InvalidInput(format!(
            "unknown scratchpad operation '{other}'"
        ))),
    }
}

async fn persist(ctx: &ToolContext) {
    let snapshot = ctx.scratchpad.to_json().await;
    if let Err(e) = ctx.workspace.ensure_forge_dir().and_then(|_| {
        std::fs::write(
            ctx.workspace.scratchpad_path(),
            serde_json::to_string_pretty(&snapshot).unwrap_or_default(),
        )
    }) {
        tracing::debug!(error = %e, "could not persist scratchpad");
    }
}

// ---------------------------------------------------------------------------
// Clarification bridge
// ---------------------------------------------------------------------------

/// Answers clarification questions. The conductor's implementation opens
/// a gate, enforces the per-build limit, and times out to the sentinel
/// answer; tests stub it.
#[async_trait]
pub trait Clarifier: Send + Sync {
    async fn ask(&self, question: &str) -> Result<String, ToolError>;
}

pub async fn ask_clarification(input: &Value, ctx: &ToolContext) -> Result<String, ToolError> {
    let question = input
        .get("question")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidInput("missing 'question'".into()))?;
    let Some(clarifier) = &ctx.clarifier else {
        return Ok(json!({
            "answer": "proceed with best judgement",
            "note": "no clarification channel is attached to this build",
        })
        .to_string());
    };
    let answer = clarifier.ask(question).await?;
    Ok(json!({"answer": answer}).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{Contract, ContractSnapshot, MemoryContractStore};
    use crate::phase::Phase;
    use crate::tools::ToolContext;
    use crate::workspace::Workspace;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn make_context() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryContractStore::new();
        let project_id = Uuid::new_v4();
        store
            .put(project_id, Contract::new(ContractType::Stack, "Python 3.12"))
            .await;
        let ctx = ToolContext {
            workspace: Workspace::new(dir.path()).unwrap(),
            project_id,
            contracts: Arc::new(store),
            snapshot: ContractSnapshot::capture(vec![Contract::new(
                ContractType::Boundaries,
                "{\"layers\":[]}",
            )]),
            phases: vec![Phase::new(1, "Foundation", "Lay it.", vec!["a.py".into()])],
            scratchpad: Arc::new(Scratchpad::new()),
            clarifier: None,
        };
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_get_project_contract_live() {
        let (_dir, ctx) = make_context().await;
        let out: Value = serde_json::from_str(
            &get_project_contract(&json!({"contract_type": "stack"}), &ctx)
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(out["content"], "Python 3.12");
    }

    #[tokio::test]
    async fn test_get_project_contract_missing_is_soft() {
        let (_dir, ctx) = make_context().await;
        let out: Value = serde_json::from_str(
            &get_project_contract(&json!({"contract_type": "ui"}), &ctx)
                .await
                .unwrap(),
        )
        .unwrap();
        assert!(out["content"].is_null());
    }

    #[tokio::test]
    async fn test_get_build_contracts_returns_pinned_snapshot() {
        let (_dir, ctx) = make_context().await;
        let out: Value =
            serde_json::from_str(&get_build_contracts(&ctx).unwrap()).unwrap();
        assert!(out["contracts"].as_str().unwrap().contains("boundaries"));
    }

    #[tokio::test]
    async fn test_get_phase_window() {
        let (_dir, ctx) = make_context().await;
        let out: Value =
            serde_json::from_str(&get_phase_window(&json!({"phase": 1}), &ctx).unwrap()).unwrap();
        assert_eq!(out["name"], "Foundation");

        let out: Value =
            serde_json::from_str(&get_phase_window(&json!({"phase": 9}), &ctx).unwrap()).unwrap();
        assert!(out["message"].as_str().unwrap().contains("Phase 9"));
    }

    #[tokio::test]
    async fn test_scratchpad_write_read_append_list() {
        let (_dir, ctx) = make_context().await;
        scratchpad(
            &json!({"operation": "write", "key": "lessons", "value": "first"}),
            &ctx,
        )
        .await
        .unwrap();
        scratchpad(
            &json!({"operation": "append", "key": "lessons", "value": "second"}),
            &ctx,
        )
        .await
        .unwrap();

        let read: Value = serde_json::from_str(
            &scratchpad(&json!({"operation": "read", "key": "lessons"}), &ctx)
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(read["value"], "first\nsecond");

        let list: Value = serde_json::from_str(
            &scratchpad(&json!({"operation": "list"}), &ctx).await.unwrap(),
        )
        .unwrap();
        assert_eq!(list["keys"][0], "lessons");

        // Persisted alongside the in-memory copy.
        assert!(ctx.workspace.scratchpad_path().exists());
    }

    #[tokio::test]
    async fn test_clarification_without_channel_uses_sentinel() {
        let (_dir, ctx) = make_context().await;
        let out: Value = serde_json::from_str(
            &ask_clarification(&json!({"question": "Which DB?"}), &ctx)
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(out["answer"], "proceed with best judgement");
    }

    #[tokio::test]
    async fn test_clarification_with_channel() {
        struct FixedAnswer;
        #[async_trait]
        impl Clarifier for FixedAnswer {
            async fn ask(&self, _question: &str) -> Result<String, ToolError> {
                Ok("use postgres".into())
            }
        }

        let (_dir, mut ctx) = make_context().await;
        ctx.clarifier = Some(Arc::new(FixedAnswer));
        let out: Value = serde_json::from_str(
            &ask_clarification(&json!({"question": "Which DB?"}), &ctx)
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(out["answer"], "use postgres");
    }
}
