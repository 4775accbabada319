//! Tool registry — typed specs, schema'd inputs, gatekept dispatch.
//!
//! Every tool the engine exposes to a sub-agent is registered here with a
//! name, a description, and a JSON input schema. Dispatch goes through a
//! single gatekeeper: unknown names are rejected before execution, and the
//! caller supplies the active role's allow-list so disallowed names come
//! back as protocol errors the model can recover from.
//!
//! All file tools execute against the build's sandboxed [`Workspace`];
//! forge tools proxy to the contract store, the pinned snapshot, the
//! scratchpad, and the clarification bridge.

pub mod file_ops;
pub mod forge_ops;

use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::contracts::{ContractSnapshot, ContractStore};
use crate::errors::ToolError;
use crate::phase::Phase;
use crate::workspace::Workspace;

pub use forge_ops::{Clarifier, Scratchpad};

/// One registered tool: name, description, and the declared input schema.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

impl ToolSpec {
    /// Render the provider-facing tool definition.
    pub fn to_definition(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema,
        })
    }
}

fn string_prop(desc: &str) -> Value {
    json!({"type": "string", "description": desc})
}

/// The full builder tool registry, in stable order.
pub fn builder_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "read_file",
            description: "Read a file from the project. Returns content (truncated past 8000 chars), size, and a truncation flag.",
            input_schema: json!({
                "type": "object",
                "properties": {"path": string_prop("Project-relative file path")},
                "required": ["path"],
            }),
        },
        ToolSpec {
            name: "list_directory",
            description: "List a directory's subdirectories and files. Build/system directories are skipped.",
            input_schema: json!({
                "type": "object",
                "properties": {"path": string_prop("Project-relative directory path, '.' for root")},
                "required": ["path"],
            }),
        },
        ToolSpec {
            name: "search_code",
            description: "Search project files for a regex pattern. Returns matching path:line:text triples.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pattern": string_prop("Regex pattern to search for"),
                    "path": string_prop("Optional subdirectory to scope the search"),
                },
                "required": ["pattern"],
            }),
        },
        ToolSpec {
            name: "write_file",
            description: "Create or overwrite a file with the given content. Parent directories are created.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": string_prop("Project-relative file path"),
                    "content": string_prop("Full file content"),
                },
                "required": ["path", "content"],
            }),
        },
        ToolSpec {
            name: "edit_file",
            description: "Apply a surgical edit: replace one exact occurrence of old_text with new_text.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": string_prop("Project-relative file path"),
                    "old_text": string_prop("Exact text to replace (must occur exactly once)"),
                    "new_text": string_prop("Replacement text"),
                },
                "required": ["path", "old_text", "new_text"],
            }),
        },
        ToolSpec {
            name: "check_syntax",
            description: "Run a structural syntax check on a file (JSON/YAML/TOML parse; bracket balance for code).",
            input_schema: json!({
                "type": "object",
                "properties": {"path": string_prop("Project-relative file path")},
                "required": ["path"],
            }),
        },
        ToolSpec {
            name: "run_command",
            description: "Run a shell command inside the project directory with a timeout. Returns stdout, stderr, exit_code.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": string_prop("Command line to execute"),
                    "timeout_seconds": {"type": "integer", "description": "Timeout (default 60, max 300)"},
                },
                "required": ["command"],
            }),
        },
        ToolSpec {
            name: "forge_get_project_contract",
            description: "Fetch the current content of one project contract by type (blueprint, manifesto, stack, schema, physics, boundaries, phases, ui).",
            input_schema: json!({
                "type": "object",
                "properties": {"contract_type": string_prop("Contract type name")},
                "required": ["contract_type"],
            }),
        },
        ToolSpec {
            name: "forge_list_project_contracts",
            description: "List the contract types available for this project.",
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolSpec {
            name: "forge_get_build_contracts",
            description: "Fetch the pinned contract snapshot captured when this build started. Immutable for the build's lifetime.",
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolSpec {
            name: "forge_get_phase_window",
            description: "Fetch the definition of one phase (number, name, objective, deliverables) from the phases contract.",
            input_schema: json!({
                "type": "object",
                "properties": {"phase": {"type": "integer", "description": "Phase number"}},
                "required": ["phase"],
            }),
        },
        ToolSpec {
            name: "forge_scratchpad",
            description: "Shared per-build key-value log. Operations: write, append, read, list.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "operation": string_prop("write | append | read | list"),
                    "key": string_prop("Scratchpad key"),
                    "value": string_prop("Value for write/append"),
                },
                "required": ["operation"],
            }),
        },
        ToolSpec {
            name: "forge_ask_clarification",
            description: "Ask the user a clarifying question and wait for the answer. Use sparingly; a per-build limit applies.",
            input_schema: json!({
                "type": "object",
                "properties": {"question": string_prop("The question to ask the user")},
                "required": ["question"],
            }),
        },
    ]
}

/// Rendered definitions for a name subset, preserving registry order.
pub fn definitions_for(names: &HashSet<&str>) -> Vec<Value> {
    builder_tools()
        .iter()
        .filter(|spec| names.contains(spec.name))
        .map(|spec| spec.to_definition())
        .collect()
}

/// Everything tool execution needs, owned per build.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace: Workspace,
    pub project_id: Uuid,
    pub contracts: Arc<dyn ContractStore>,
    pub snapshot: ContractSnapshot,
    pub phases: Vec<Phase>,
    pub scratchpad: Arc<Scratchpad>,
    pub clarifier: Option<Arc<dyn Clarifier>>,
}

/// Execute one tool by name. The single dispatch gatekeeper: unknown
/// names never reach an executor.
pub async fn execute_tool(
    name: &str,
    input: &Value,
    ctx: &ToolContext,
) -> Result<String, ToolError> {
    match name {
        "read_file" => file_ops::read_file(input, &ctx.workspace),
        "list_directory" => file_ops::list_directory(input, &ctx.workspace),
        "search_code" => file_ops::search_code(input, &ctx.workspace),
        "write_file" => file_ops::write_file(input, &ctx.workspace),
        "edit_file" => file_ops::edit_file(input, &ctx.workspace),
        "check_syntax" => file_ops::check_syntax(input, &ctx.workspace),
        "run_command" => file_ops::run_command(input, &ctx.workspace).await,
        "forge_get_project_contract" => forge_ops::get_project_contract(input, ctx).await,
        "forge_list_project_contracts" => forge_ops::list_project_contracts(ctx).await,
        "forge_get_build_contracts" => forge_ops::get_build_contracts(ctx),
        "forge_get_phase_window" => forge_ops::get_phase_window(input, ctx),
        "forge_scratchpad" => forge_ops::scratchpad(input, ctx).await,
        "forge_ask_clarification" => forge_ops::ask_clarification(input, ctx).await,
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::MemoryContractStore;

    pub(crate) fn test_context(workspace: Workspace) -> ToolContext {
        ToolContext {
            workspace,
            project_id: Uuid::new_v4(),
            contracts: Arc::new(MemoryContractStore::new()),
            snapshot: ContractSnapshot::capture(vec![]),
            phases: vec![],
            scratchpad: Arc::new(Scratchpad::default()),
            clarifier: None,
        }
    }

    #[test]
    fn test_registry_has_all_names() {
        let names: Vec<&str> = builder_tools().iter().map(|t| t.name).collect();
        for expected in [
            "read_file",
            "list_directory",
            "search_code",
            "write_file",
            "edit_file",
            "check_syntax",
            "run_command",
            "forge_get_project_contract",
            "forge_list_project_contracts",
            "forge_get_build_contracts",
            "forge_get_phase_window",
            "forge_scratchpad",
            "forge_ask_clarification",
        ] {
            assert!(names.contains(&expected), "missing tool {expected}");
        }
    }

    #[test]
    fn test_definitions_carry_schema() {
        let tools = builder_tools();
        let read = tools.iter().find(|t| t.name == "read_file").unwrap();
        let def = read.to_definition();
        assert_eq!(def["name"], "read_file");
        assert_eq!(def["input_schema"]["required"][0], "path");
    }

    #[test]
    fn test_definitions_for_preserves_registry_order() {
        let names: HashSet<&str> = ["write_file", "read_file"].into_iter().collect();
        let defs = definitions_for(&names);
        assert_eq!(defs.len(), 2);
        // Registry order, not request order.
        assert_eq!(defs[0]["name"], "read_file");
        assert_eq!(defs[1]["name"], "write_file");
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(Workspace::new(dir.path()).unwrap());
        let err = execute_tool("launch_missiles", &json!({}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }
}
