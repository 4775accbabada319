//! Sub-agent handoff protocol — typed roles, per-role tool sets, the
//! tool-use loop.
//!
//! Least privilege for LLM sub-agents: each role receives only the tools
//! it needs.
//!
//! * **Scout** — read-only reconnaissance (files, contracts, scratchpad).
//! * **Coder** — file creation plus syntax checking and commands.
//! * **Auditor** — read-only structural review; it cannot fix code itself.
//! * **Fixer** — surgical edits only: `edit_file` but never `write_file`,
//!   and the pinned contract snapshot as its only contract surface.
//!
//! A `Handoff` carries everything one invocation needs; a
//! `SubAgentResult` captures its output. The runner enforces the
//! allow-list at dispatch — a disallowed call comes back to the model as
//! a protocol-error tool result, never as an engine failure.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cost::usage_cost;
use crate::events::{Broadcaster, BuildEvent};
use crate::llm::{
    ContentBlock, LlmClient, Message, RetryCallback, StreamItem, StreamRequest, StreamUsage,
    ToolCall,
};
use crate::tools::{ToolContext, definitions_for, execute_tool};
use crate::workspace::Workspace;

/// Safety limit on tool-use rounds per session.
pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 25;

/// Tool results echoed into history are truncated past this.
const MAX_TOOL_RESULT_CHARS: usize = 10_000;

// ---------------------------------------------------------------------------
// Roles and allow-lists
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubAgentRole {
    Scout,
    Coder,
    Auditor,
    Fixer,
}

impl SubAgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubAgentRole::Scout => "scout",
            SubAgentRole::Coder => "coder",
            SubAgentRole::Auditor => "auditor",
            SubAgentRole::Fixer => "fixer",
        }
    }

    /// Which worker bucket this role's activity is attributed to.
    pub fn model_bucket(&self) -> &'static str {
        match self {
            SubAgentRole::Coder | SubAgentRole::Fixer => "opus",
            SubAgentRole::Scout | SubAgentRole::Auditor => "sonnet",
        }
    }
}

impl fmt::Display for SubAgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// The allowed tool names for a role. Enforced in one gatekeeper around
/// every dispatch; the model is never trusted to self-limit.
pub fn tool_names_for_role(role: SubAgentRole) -> HashSet<&'static str> {
    match role {
        // Scout — pure read for reconnaissance / context gathering.
        SubAgentRole::Scout => HashSet::from([
            "read_file",
            "list_directory",
            "search_code",
            "forge_get_project_contract",
            "forge_list_project_contracts",
            "forge_get_phase_window",
            "forge_scratchpad",
            "forge_ask_clarification",
        ]),
        // Coder — writes files and checks syntax.
        SubAgentRole::Coder => HashSet::from([
            "read_file",
            "list_directory",
            "search_code",
            "write_file",
            "edit_file",
            "check_syntax",
            "run_command",
            "forge_get_project_contract",
            "forge_list_project_contracts",
            "forge_get_phase_window",
            "forge_scratchpad",
            "forge_ask_clarification",
        ]),
        // Auditor — read-only structural review, no clarification.
        SubAgentRole::Auditor => HashSet::from([
            "read_file",
            "list_directory",
            "search_code",
            "forge_get_project_contract",
            "forge_list_project_contracts",
            "forge_scratchpad",
        ]),
        // Fixer — edit_file only (no write_file), pinned snapshot only.
        SubAgentRole::Fixer => HashSet::from([
            "read_file",
            "list_directory",
            "search_code",
            "edit_file",
            "check_syntax",
            "forge_scratchpad",
            "forge_get_build_contracts",
        ]),
    }
}

/// The role's base system prompt.
pub fn system_prompt_for_role(role: SubAgentRole) -> &'static str {
    match role {
        SubAgentRole::Scout => {
            "You are a **Scout** sub-agent in the ForgeGuard build system.\n\n\
             Your job is to gather context about the project before coding begins. \
             You have READ-ONLY access to the project files and governance contracts.\n\n\
             Pull only the contracts you need via forge_get_project_contract — do not \
             assume generic templates apply.\n\n\
             Tasks:\n\
             - Map the existing directory structure\n\
             - Identify key interfaces, imports, and patterns\n\
             - Summarise what the coder needs to know\n\n\
             Output a structured JSON object with your findings:\n\
             ```json\n{\"key_interfaces\": [], \"patterns\": {}, \"imports_map\": {}, \"recommendations\": \"\"}\n```\n\n\
             Rules:\n\
             - Do NOT create, modify, or delete any files\n\
             - Keep your summary under 4000 tokens\n"
        }
        SubAgentRole::Coder => {
            "You are a **Coder** sub-agent in the ForgeGuard build system.\n\n\
             You write production-quality code for the specific files assigned to you.\n\n\
             Pull the contracts relevant to your files before writing: \
             forge_get_project_contract('stack') for required languages and versions, \
             'physics' for the canonical API spec, 'boundaries' for layer rules, \
             'schema' if your files touch data models. Be selective.\n\n\
             Rules:\n\
             - Write ONLY the files specified in your assignment\n\
             - Follow the project contracts exactly\n\
             - Respect layer boundaries\n\
             - Check syntax after writing each file\n\
             - Do NOT run tests (the audit step handles review separately)\n\n\
             Code style: output pure code. One-line docstrings. Comments only where \
             logic is non-obvious. Every token of output costs money.\n\n\
             After writing all assigned files, output a brief summary:\n\
             ```json\n{\"files_written\": [], \"decisions\": \"\", \"known_issues\": \"\"}\n```\n"
        }
        SubAgentRole::Auditor => {
            "You are an **Auditor** sub-agent in the ForgeGuard build system.\n\n\
             You perform structural quality review of generated code. \
             You have READ-ONLY access — you cannot modify any files.\n\n\
             Check for:\n\
             - Missing or broken imports/exports\n\
             - Functions/classes referenced but never defined\n\
             - Contract violations (layer boundaries, naming, API shape)\n\
             - Obvious logic errors or unreachable code\n\n\
             Do NOT flag: style preferences, naming conventions, missing docs, \
             optional improvements.\n\n\
             Output one verdict per file:\n\
             ```json\n{\"files\": [{\"path\": \"...\", \"verdict\": \"PASS|FAIL\", \
             \"findings\": [{\"line\": 1, \"severity\": \"error\", \"message\": \"...\"}]}]}\n```\n\n\
             If a file is structurally sound, set verdict PASS with empty findings.\n"
        }
        SubAgentRole::Fixer => {
            "You are a **Fixer** sub-agent in the ForgeGuard build system.\n\n\
             You apply targeted, surgical fixes to files that failed audit. \
             You can use edit_file to patch specific lines — you CANNOT use \
             write_file (no full rewrites).\n\n\
             Before fixing, call forge_get_build_contracts() for the contract \
             snapshot frozen at build start. Mid-build contract edits do NOT \
             affect these snapshots.\n\n\
             Rules:\n\
             - Fix ONLY the issues listed in the audit findings\n\
             - Do NOT refactor, restyle, or change working code\n\
             - Preserve all existing functionality\n\
             - Check syntax after each fix\n\n\
             After fixing, output:\n\
             ```json\n{\"files_fixed\": [], \"edits_applied\": 0, \"remaining_issues\": \"none\"}\n```\n"
        }
    }
}

// ---------------------------------------------------------------------------
// Handoff / result
// ---------------------------------------------------------------------------

/// Everything one sub-agent invocation needs. The conductor (or tier
/// executor) creates one per dispatch; the runner consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    pub role: SubAgentRole,
    pub build_id: Uuid,
    pub user_id: Uuid,

    /// Human-readable task description.
    pub assignment: String,
    /// Target file paths.
    #[serde(default)]
    pub files: Vec<String>,

    /// Slim context, kept small on purpose.
    #[serde(default)]
    pub context_files: BTreeMap<String, String>,
    #[serde(default)]
    pub contracts_text: String,
    #[serde(default)]
    pub phase_deliverables: String,
    /// Audit findings for the fixer.
    #[serde(default)]
    pub error_context: String,

    /// Empty → role default.
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub handoff_id: String,
    #[serde(default)]
    pub parent_handoff_id: String,
}

fn default_max_tokens() -> u32 {
    16_384
}

fn default_timeout() -> u64 {
    600
}

impl Handoff {
    pub fn new(role: SubAgentRole, build_id: Uuid, user_id: Uuid, assignment: &str) -> Self {
        Self {
            role,
            build_id,
            user_id,
            assignment: assignment.to_string(),
            files: Vec::new(),
            context_files: BTreeMap::new(),
            contracts_text: String::new(),
            phase_deliverables: String::new(),
            error_context: String::new(),
            model: String::new(),
            max_tokens: default_max_tokens(),
            timeout_seconds: default_timeout(),
            handoff_id: String::new(),
            parent_handoff_id: String::new(),
        }
    }

    fn ensure_id(&mut self) {
        if self.handoff_id.is_empty() {
            self.handoff_id = format!(
                "{}_{}_{}",
                self.role,
                &self.build_id.simple().to_string()[..8],
                Utc::now().timestamp()
            );
        }
    }

    /// One user message bundling context, deliverables, findings, and the
    /// assignment.
    fn user_message(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if !self.phase_deliverables.is_empty() {
            parts.push(format!("## Phase Deliverables\n{}\n", self.phase_deliverables));
        }
        if !self.context_files.is_empty() {
            let mut section = String::from("## Context Files\n");
            for (path, content) in &self.context_files {
                section.push_str(&format!("### {path}\n```\n{content}\n```\n"));
            }
            parts.push(section);
        }
        if !self.error_context.is_empty() {
            parts.push(format!(
                "## Error Context / Audit Findings\n{}\n",
                self.error_context
            ));
        }
        parts.push(format!("## Assignment\n{}\n", self.assignment));
        if !self.files.is_empty() {
            let list: Vec<String> = self.files.iter().map(|f| format!("- `{f}`")).collect();
            parts.push(format!("## Target Files\n{}\n", list.join("\n")));
        }
        parts.join("\n")
    }
}

/// The output and metrics of one handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentResult {
    pub handoff_id: String,
    pub role: SubAgentRole,
    pub status: HandoffStatus,

    #[serde(default)]
    pub text_output: String,
    /// Parsed from a trailing fenced or bare `{...}` block, if present.
    #[serde(default)]
    pub structured_output: Value,
    #[serde(default)]
    pub files_written: Vec<String>,
    #[serde(default)]
    pub files_read: Vec<String>,

    pub usage: StreamUsage,
    pub cost_usd: Decimal,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,

    #[serde(default)]
    pub error: String,
}

impl SubAgentResult {
    fn started(handoff_id: &str, role: SubAgentRole) -> Self {
        let now = Utc::now();
        Self {
            handoff_id: handoff_id.to_string(),
            role,
            status: HandoffStatus::Running,
            text_output: String::new(),
            structured_output: Value::Null,
            files_written: Vec::new(),
            files_read: Vec::new(),
            usage: StreamUsage::default(),
            cost_usd: Decimal::ZERO,
            started_at: now,
            finished_at: now,
            duration_seconds: 0.0,
            error: String::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == HandoffStatus::Completed
    }
}

/// Persist a handoff to `.forge/handoffs/` for debugging and replay.
pub fn save_handoff(workspace: &Workspace, handoff: &Handoff) -> std::io::Result<()> {
    workspace.ensure_forge_dir()?;
    let json = serde_json::to_string_pretty(handoff)?;
    std::fs::write(workspace.handoff_path(&handoff.handoff_id), json)
}

pub fn load_handoff(workspace: &Workspace, handoff_id: &str) -> Option<Handoff> {
    let raw = std::fs::read_to_string(workspace.handoff_path(handoff_id)).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Persist a result alongside its handoff.
pub fn save_result(workspace: &Workspace, result: &SubAgentResult) -> std::io::Result<()> {
    workspace.ensure_forge_dir()?;
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(workspace.result_path(&result.handoff_id), json)
}

// ---------------------------------------------------------------------------
// Context pack builder
// ---------------------------------------------------------------------------

/// Assemble a minimal `{path: content}` context for a sub-agent: target
/// files first, then files their imports resolve to, then siblings,
/// trimmed to file-count and character budgets.
pub fn build_context_pack(
    workspace: &Workspace,
    target_files: &[String],
    max_files: usize,
    max_chars: usize,
) -> BTreeMap<String, String> {
    const PER_FILE_CAP: usize = 30_000;

    let mut ctx: BTreeMap<String, String> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    let mut add_file = |rel: &str,
                        ctx: &mut BTreeMap<String, String>,
                        order: &mut Vec<String>,
                        seen: &mut HashSet<String>| {
        let rel = rel.replace('\\', "/");
        if seen.contains(&rel) || ctx.len() >= max_files {
            return;
        }
        seen.insert(rel.clone());
        let Ok(mut content) = workspace.read(&rel) else {
            return;
        };
        if content.len() > PER_FILE_CAP {
            let mut end = PER_FILE_CAP;
            while !content.is_char_boundary(end) {
                end -= 1;
            }
            content.truncate(end);
            content.push_str("\n[... truncated ...]\n");
        }
        ctx.insert(rel.clone(), content);
        order.push(rel);
    };

    // 1. Targets first, always included.
    for target in target_files {
        add_file(target, &mut ctx, &mut order, &mut seen);
    }

    // 2. Imports parsed out of the targets.
    let import_re = regex::Regex::new(r"(?m)^\s*(?:from|import)\s+([\w.]+)").unwrap();
    for target in target_files {
        let Some(content) = ctx.get(&target.replace('\\', "/")).cloned() else {
            continue;
        };
        for caps in import_re.captures_iter(&content) {
            let module = caps[1].replace('.', "/");
            add_file(&format!("{module}.py"), &mut ctx, &mut order, &mut seen);
            add_file(
                &format!("{module}/__init__.py"),
                &mut ctx,
                &mut order,
                &mut seen,
            );
        }
    }

    // 3. Siblings in the same directories.
    let mut dirs_seen = HashSet::new();
    for target in target_files {
        let rel = target.replace('\\', "/");
        let parent = match rel.rfind('/') {
            Some(idx) => rel[..idx].to_string(),
            None => ".".to_string(),
        };
        if !dirs_seen.insert(parent.clone()) {
            continue;
        }
        let Ok((_dirs, files)) = workspace.list(&parent) else {
            continue;
        };
        for name in files {
            if ctx.len() >= max_files {
                break;
            }
            let good_ext = [".py", ".ts", ".tsx", ".js", ".jsx"]
                .iter()
                .any(|ext| name.ends_with(ext));
            if !good_ext {
                continue;
            }
            let sibling = if parent == "." {
                name
            } else {
                format!("{parent}/{name}")
            };
            add_file(&sibling, &mut ctx, &mut order, &mut seen);
        }
    }

    // 4. Trim to the character budget, targets prioritised.
    let total: usize = ctx.values().map(|c| c.len()).sum();
    if total > max_chars {
        let mut trimmed = BTreeMap::new();
        let mut running = 0usize;
        for target in target_files {
            let key = target.replace('\\', "/");
            if let Some(content) = ctx.get(&key) {
                running += content.len();
                trimmed.insert(key, content.clone());
            }
        }
        for key in order {
            if trimmed.contains_key(&key) {
                continue;
            }
            let content = &ctx[&key];
            if running + content.len() > max_chars {
                break;
            }
            running += content.len();
            trimmed.insert(key, content.clone());
        }
        return trimmed;
    }

    ctx
}

/// Extract a JSON object from the tail of LLM output: the last fenced
/// ```` ```json ```` block, else the last bare `{...}`. Never fails.
pub fn extract_json_block(text: &str) -> Value {
    if text.is_empty() {
        return Value::Null;
    }

    let fence_re =
        regex::Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("static regex");
    if let Some(caps) = fence_re
        .captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        && let Ok(value) = serde_json::from_str(caps)
    {
        return value;
    }

    // Last balanced { ... } scanning from the end.
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut end = None;
    for i in (0..bytes.len()).rev() {
        match bytes[i] {
            b'}' => {
                if depth == 0 {
                    end = Some(i);
                }
                depth += 1;
            }
            b'{' => {
                depth -= 1;
                if depth == 0
                    && let Some(e) = end
                    && let Ok(value) = serde_json::from_str(&text[i..=e])
                {
                    return value;
                }
            }
            _ => {}
        }
    }

    Value::Null
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes handoffs: system prompt + tools for the role, the tool-use
/// loop, allow-list enforcement, timeout, and result assembly.
pub struct SubAgentRunner {
    llm: Arc<LlmClient>,
    tools: ToolContext,
    broadcaster: Arc<dyn Broadcaster>,
    builder_model: String,
    planner_model: String,
    max_tool_rounds: u32,
    cancel: CancellationToken,
}

impl SubAgentRunner {
    pub fn new(
        llm: Arc<LlmClient>,
        tools: ToolContext,
        broadcaster: Arc<dyn Broadcaster>,
        builder_model: &str,
        planner_model: &str,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            llm,
            tools,
            broadcaster,
            builder_model: builder_model.to_string(),
            planner_model: planner_model.to_string(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            cancel,
        }
    }

    pub fn with_max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    fn default_model_for(&self, role: SubAgentRole) -> &str {
        match role {
            SubAgentRole::Coder | SubAgentRole::Fixer => &self.builder_model,
            SubAgentRole::Scout | SubAgentRole::Auditor => &self.planner_model,
        }
    }

    /// Run one sub-agent session to completion (or timeout/failure).
    pub async fn run(&self, mut handoff: Handoff) -> SubAgentResult {
        handoff.ensure_id();
        let mut result = SubAgentResult::started(&handoff.handoff_id, handoff.role);
        let model = if handoff.model.is_empty() {
            self.default_model_for(handoff.role).to_string()
        } else {
            handoff.model.clone()
        };
        result.usage.model = model.clone();

        self.broadcaster
            .send(
                handoff.user_id,
                BuildEvent::SubagentStart {
                    role: handoff.role.to_string(),
                    handoff_id: handoff.handoff_id.clone(),
                    files: handoff.files.clone(),
                    assignment: preview(&handoff.assignment, 200),
                },
            )
            .await;

        if let Err(e) = save_handoff(&self.tools.workspace, &handoff) {
            tracing::debug!(error = %e, "could not save handoff");
        }

        let timeout = Duration::from_secs(handoff.timeout_seconds);
        match tokio::time::timeout(timeout, self.run_tool_loop(&handoff, &model, &mut result)).await
        {
            Ok(Ok(())) => {
                result.status = HandoffStatus::Completed;
            }
            Ok(Err(error)) => {
                result.error = error;
                result.status = HandoffStatus::Failed;
                tracing::warn!(
                    role = %handoff.role,
                    error = %result.error,
                    "sub-agent failed"
                );
            }
            Err(_) => {
                result.error = format!("Sub-agent timed out after {}s", handoff.timeout_seconds);
                result.status = HandoffStatus::Failed;
                tracing::warn!(role = %handoff.role, "sub-agent timed out");
            }
        }

        result.finished_at = Utc::now();
        result.duration_seconds = (result.finished_at - result.started_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        result.cost_usd = usage_cost(&result.usage);
        result.structured_output = extract_json_block(&result.text_output);

        self.broadcaster
            .send(
                handoff.user_id,
                BuildEvent::SubagentDone {
                    role: handoff.role.to_string(),
                    handoff_id: handoff.handoff_id.clone(),
                    status: match result.status {
                        HandoffStatus::Completed => "completed".into(),
                        _ => "failed".into(),
                    },
                    files_written: result.files_written.clone(),
                    duration_s: (result.duration_seconds * 10.0).round() / 10.0,
                    tokens: result.usage.total_input() + result.usage.output_tokens,
                    error: preview(&result.error, 200),
                },
            )
            .await;

        if let Err(e) = save_result(&self.tools.workspace, &result) {
            tracing::debug!(error = %e, "could not save result");
        }

        result
    }

    /// The core loop: stream → collect tool calls → execute → echo
    /// results → repeat until a round produces zero tool calls.
    async fn run_tool_loop(
        &self,
        handoff: &Handoff,
        model: &str,
        result: &mut SubAgentResult,
    ) -> Result<(), String> {
        let allowed = tool_names_for_role(handoff.role);
        let tool_defs = definitions_for(&allowed);

        let mut system_blocks = vec![system_prompt_for_role(handoff.role).to_string()];
        if !handoff.contracts_text.is_empty() {
            system_blocks.push(format!(
                "=== PROJECT CONTRACTS ===\n\n{}",
                handoff.contracts_text
            ));
        }

        let mut messages = vec![Message::user_text(&handoff.user_message())];
        let mut text_output = String::new();

        for _round in 0..self.max_tool_rounds {
            if self.cancel.is_cancelled() {
                return Err("cancelled".into());
            }

            let request = StreamRequest {
                model: model.to_string(),
                system_blocks: system_blocks.clone(),
                messages: messages.clone(),
                max_tokens: handoff.max_tokens,
                tools: tool_defs.clone(),
                thinking_budget: 0,
            };

            let (tx, mut rx) = mpsc::channel(64);
            let llm = Arc::clone(&self.llm);
            let cancel = self.cancel.clone();
            let on_retry = self.retry_notifier(handoff);
            let stream_task = tokio::spawn(async move {
                llm.stream(request, tx, Some(on_retry), Some(cancel)).await
            });

            let mut round_text = String::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            while let Some(item) = rx.recv().await {
                match item {
                    StreamItem::Text(chunk) => round_text.push_str(&chunk),
                    StreamItem::Tool(call) => tool_calls.push(call),
                    StreamItem::Thinking(_) => {}
                }
            }
            let usage = stream_task
                .await
                .map_err(|e| format!("stream task panicked: {e}"))?
                .map_err(|e| e.to_string())?;
            result.usage.input_tokens += usage.input_tokens;
            result.usage.output_tokens += usage.output_tokens;
            result.usage.cache_read_input_tokens += usage.cache_read_input_tokens;
            result.usage.cache_creation_input_tokens += usage.cache_creation_input_tokens;
            if !usage.model.is_empty() {
                result.usage.model = usage.model;
            }

            text_output.push_str(&round_text);

            // Zero tool calls — the agent is done.
            if tool_calls.is_empty() {
                break;
            }

            let mut result_blocks = Vec::new();
            for call in &tool_calls {
                let outcome = self.dispatch(handoff, &allowed, call, result).await;
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content: preview(&outcome, MAX_TOOL_RESULT_CHARS),
                });
            }

            // Echo the assistant turn, then the tool results.
            let mut assistant_blocks = Vec::new();
            if !round_text.is_empty() {
                assistant_blocks.push(ContentBlock::Text { text: round_text });
            }
            for call in &tool_calls {
                assistant_blocks.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                });
            }
            messages.push(Message::assistant_blocks(assistant_blocks));
            messages.push(Message::user_blocks(result_blocks));
        }

        result.text_output = text_output;
        Ok(())
    }

    /// Gatekept execution of one call. Disallowed and failing tools both
    /// come back as error strings for the model.
    async fn dispatch(
        &self,
        handoff: &Handoff,
        allowed: &HashSet<&'static str>,
        call: &ToolCall,
        result: &mut SubAgentResult,
    ) -> String {
        if !allowed.contains(call.name.as_str()) {
            tracing::warn!(
                role = %handoff.role,
                tool = %call.name,
                "disallowed tool blocked"
            );
            return format!(
                "Error: tool '{}' is not available to the {} role.",
                call.name, handoff.role
            );
        }

        self.broadcaster
            .send(
                handoff.user_id,
                BuildEvent::ToolUse {
                    role: handoff.role.to_string(),
                    tool: call.name.clone(),
                    detail: describe_tool_call(&call.name, &call.input),
                },
            )
            .await;

        let outcome = match execute_tool(&call.name, &call.input, &self.tools).await {
            Ok(output) => output,
            Err(e) => format!("Tool error: {e}"),
        };

        // Track files read/written for the result.
        let path = call.input.get("path").and_then(|v| v.as_str()).unwrap_or("");
        match call.name.as_str() {
            "read_file" | "list_directory" | "search_code" => {
                if !path.is_empty() && !result.files_read.contains(&path.to_string()) {
                    result.files_read.push(path.to_string());
                }
            }
            "write_file" | "edit_file" => {
                if !path.is_empty() && !result.files_written.contains(&path.to_string()) {
                    result.files_written.push(path.to_string());
                }
            }
            "forge_scratchpad" => {
                let op = call
                    .input
                    .get("operation")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_lowercase();
                if op == "write" || op == "append" {
                    let key = call.input.get("key").and_then(|v| v.as_str()).unwrap_or("");
                    let value = call.input.get("value").and_then(|v| v.as_str()).unwrap_or("");
                    self.broadcaster
                        .send(
                            handoff.user_id,
                            BuildEvent::ScratchpadWrite {
                                key: key.to_string(),
                                source: handoff.role.model_bucket().to_string(),
                                role: handoff.role.to_string(),
                                summary: format!(
                                    "{} wrote to scratchpad: {key}",
                                    capitalise(handoff.role.as_str())
                                ),
                                content: preview(value, 2_000),
                                full_length: value.len(),
                            },
                        )
                        .await;
                }
            }
            _ => {}
        }

        outcome
    }

    fn retry_notifier(&self, handoff: &Handoff) -> Arc<RetryCallback> {
        let broadcaster = Arc::clone(&self.broadcaster);
        let user_id = handoff.user_id;
        let role = handoff.role.to_string();
        Arc::new(move |status, attempt, wait| {
            let broadcaster = Arc::clone(&broadcaster);
            let message = if status == 0 && attempt == 0 {
                format!("[{role}] budget pacing: waiting {wait:.0}s for token window")
            } else {
                format!("[{role}] API {status} — retry {attempt} in {wait:.0}s")
            };
            let role = role.clone();
            tokio::spawn(async move {
                broadcaster
                    .send(
                        user_id,
                        BuildEvent::BuildLog {
                            message,
                            source: role,
                            level: "warn".into(),
                        },
                    )
                    .await;
            });
        })
    }
}

fn capitalise(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn preview(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn describe_tool_call(name: &str, input: &Value) -> String {
    let path = input.get("path").and_then(|v| v.as_str());
    match name {
        "read_file" => format!("Reading: {}", path.unwrap_or("file")),
        "write_file" => format!("Creating: {}", path.unwrap_or("file")),
        "edit_file" => format!("Editing: {}", path.unwrap_or("file")),
        "search_code" => format!(
            "Searching: {}",
            input.get("pattern").and_then(|v| v.as_str()).unwrap_or("pattern")
        ),
        "run_command" => format!(
            "Running: {}",
            preview(
                input.get("command").and_then(|v| v.as_str()).unwrap_or("command"),
                40
            )
        ),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{ContractSnapshot, MemoryContractStore};
    use crate::events::ChannelBroadcaster;
    use crate::limiter::ApiKeyPool;
    use crate::llm::ScriptedEndpoint;
    use crate::tools::Scratchpad;
    use serde_json::json;

    fn make_runner(
        scripts: Vec<Vec<Value>>,
        workspace: Workspace,
    ) -> (SubAgentRunner, Arc<ChannelBroadcaster>) {
        let endpoint = Arc::new(ScriptedEndpoint::new(scripts));
        let pool = Arc::new(ApiKeyPool::new(&["k".into()], 1_000_000, 1_000_000).unwrap());
        let llm = Arc::new(LlmClient::new(endpoint, pool));
        let broadcaster = Arc::new(ChannelBroadcaster::new());
        let tools = ToolContext {
            workspace,
            project_id: Uuid::new_v4(),
            contracts: Arc::new(MemoryContractStore::new()),
            snapshot: ContractSnapshot::capture(vec![]),
            phases: vec![],
            scratchpad: Arc::new(Scratchpad::new()),
            clarifier: None,
        };
        let runner = SubAgentRunner::new(
            llm,
            tools,
            broadcaster.clone(),
            "claude-opus-4-20250514",
            "claude-sonnet-4-20250514",
            CancellationToken::new(),
        );
        (runner, broadcaster)
    }

    // =========================================
    // Allow-list tests
    // =========================================

    #[test]
    fn test_scout_and_auditor_are_read_only() {
        for role in [SubAgentRole::Scout, SubAgentRole::Auditor] {
            let names = tool_names_for_role(role);
            assert!(!names.contains("write_file"), "{role} must not write");
            assert!(!names.contains("edit_file"), "{role} must not edit");
            assert!(!names.contains("run_command"), "{role} must not run commands");
        }
    }

    #[test]
    fn test_fixer_edits_but_never_writes() {
        let names = tool_names_for_role(SubAgentRole::Fixer);
        assert!(names.contains("edit_file"));
        assert!(!names.contains("write_file"));
        // Pinned snapshot only — no live contract pulls.
        assert!(names.contains("forge_get_build_contracts"));
        assert!(!names.contains("forge_get_project_contract"));
    }

    #[test]
    fn test_auditor_has_no_clarification() {
        assert!(!tool_names_for_role(SubAgentRole::Auditor).contains("forge_ask_clarification"));
        assert!(tool_names_for_role(SubAgentRole::Coder).contains("forge_ask_clarification"));
    }

    // =========================================
    // Handoff round-trip
    // =========================================

    #[test]
    fn test_handoff_serialisation_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();

        let mut handoff = Handoff::new(
            SubAgentRole::Coder,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Build the data layer",
        );
        handoff.files = vec!["app/models.py".into()];
        handoff
            .context_files
            .insert("app/db.py".into(), "session = None\n".into());
        handoff.error_context = "missing import".into();
        handoff.ensure_id();

        save_handoff(&ws, &handoff).unwrap();
        let loaded = load_handoff(&ws, &handoff.handoff_id).unwrap();
        assert_eq!(loaded, handoff);
    }

    #[test]
    fn test_extract_json_block_fenced_and_bare() {
        let fenced = "done\n```json\n{\"files_written\": [\"a.py\"]}\n```\n";
        assert_eq!(extract_json_block(fenced)["files_written"][0], "a.py");

        let bare = "summary text {\"verdict\": \"PASS\"} trailing";
        assert_eq!(extract_json_block(bare)["verdict"], "PASS");

        assert_eq!(extract_json_block("no json here"), Value::Null);
        assert_eq!(extract_json_block(""), Value::Null);
    }

    #[test]
    fn test_user_message_sections() {
        let mut handoff = Handoff::new(
            SubAgentRole::Fixer,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Fix the import",
        );
        handoff.error_context = "line 3: os not imported".into();
        handoff.files = vec!["app/a.py".into()];
        let msg = handoff.user_message();
        let findings_at = msg.find("## Error Context").unwrap();
        let assignment_at = msg.find("## Assignment").unwrap();
        let targets_at = msg.find("## Target Files").unwrap();
        assert!(findings_at < assignment_at && assignment_at < targets_at);
    }

    // =========================================
    // Runner behaviour
    // =========================================

    #[tokio::test]
    async fn test_plain_text_session_completes_in_one_round() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        let (runner, _b) = make_runner(
            vec![ScriptedEndpoint::text_reply(
                "claude-sonnet-4-20250514",
                "All clear. {\"verdict\": \"PASS\"}",
                100,
                20,
            )],
            ws,
        );

        let handoff = Handoff::new(
            SubAgentRole::Auditor,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Review app/a.py",
        );
        let result = runner.run(handoff).await;

        assert!(result.succeeded());
        assert_eq!(result.structured_output["verdict"], "PASS");
        assert_eq!(result.usage.input_tokens, 100);
        assert!(result.cost_usd > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_coder_writes_file_through_tool_round() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();

        let scripts = vec![
            ScriptedEndpoint::tool_reply(
                "claude-opus-4-20250514",
                "tu_1",
                "write_file",
                &json!({"path": "app/models.py", "content": "class User: pass\n"}),
            ),
            ScriptedEndpoint::text_reply(
                "claude-opus-4-20250514",
                "{\"files_written\": [\"app/models.py\"]}",
                50,
                10,
            ),
        ];
        let (runner, _b) = make_runner(scripts, ws.clone());

        let mut handoff = Handoff::new(
            SubAgentRole::Coder,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Write the user model",
        );
        handoff.files = vec!["app/models.py".into()];
        let result = runner.run(handoff).await;

        assert!(result.succeeded());
        assert_eq!(result.files_written, vec!["app/models.py"]);
        assert_eq!(ws.read("app/models.py").unwrap(), "class User: pass\n");
        // Result persisted to .forge/handoffs/.
        assert!(ws.result_path(&result.handoff_id).exists());
    }

    #[tokio::test]
    async fn test_disallowed_tool_returns_protocol_error_to_model() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write("app/a.py", "x = 1\n").unwrap();

        // A coder tries forge_get_build_contracts (fixer-only), then ends.
        let scripts = vec![
            ScriptedEndpoint::tool_reply(
                "claude-opus-4-20250514",
                "tu_1",
                "forge_get_build_contracts",
                &json!({}),
            ),
            ScriptedEndpoint::text_reply("claude-opus-4-20250514", "recovered", 10, 5),
        ];
        let (runner, _b) = make_runner(scripts, ws);

        let handoff = Handoff::new(
            SubAgentRole::Coder,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Do something",
        );
        let result = runner.run(handoff).await;

        // No exception surfaces; the session completed on round two.
        assert!(result.succeeded());
        assert_eq!(result.text_output, "recovered");
        assert!(result.files_written.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        struct SlowEndpoint;
        #[async_trait::async_trait]
        impl crate::llm::LlmEndpoint for SlowEndpoint {
            async fn open_stream(
                &self,
                _: &str,
                _: Value,
            ) -> Result<crate::llm::EventStream, crate::errors::LlmError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        let pool = Arc::new(ApiKeyPool::new(&["k".into()], 1_000_000, 1_000_000).unwrap());
        let llm = Arc::new(LlmClient::new(Arc::new(SlowEndpoint), pool));
        let broadcaster = Arc::new(ChannelBroadcaster::new());
        let tools = ToolContext {
            workspace: ws,
            project_id: Uuid::new_v4(),
            contracts: Arc::new(MemoryContractStore::new()),
            snapshot: ContractSnapshot::capture(vec![]),
            phases: vec![],
            scratchpad: Arc::new(Scratchpad::new()),
            clarifier: None,
        };
        let runner = SubAgentRunner::new(
            llm,
            tools,
            broadcaster,
            "claude-opus-4-20250514",
            "claude-sonnet-4-20250514",
            CancellationToken::new(),
        );

        let mut handoff = Handoff::new(
            SubAgentRole::Coder,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "Never finishes",
        );
        handoff.timeout_seconds = 1;
        let result = runner.run(handoff).await;

        assert_eq!(result.status, HandoffStatus::Failed);
        assert!(result.error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_subagent_events_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        let (runner, broadcaster) = make_runner(
            vec![ScriptedEndpoint::text_reply("m", "done", 10, 5)],
            ws,
        );
        let user_id = Uuid::new_v4();
        let mut rx = broadcaster.subscribe(user_id).await;

        let handoff = Handoff::new(SubAgentRole::Scout, Uuid::new_v4(), user_id, "Look around");
        runner.run(handoff).await;

        let mut types = Vec::new();
        while let Ok(event) = rx.try_recv() {
            types.push(event.type_name());
        }
        assert!(types.contains(&"subagent_start"));
        assert!(types.contains(&"subagent_done"));
        let start_at = types.iter().position(|t| *t == "subagent_start").unwrap();
        let done_at = types.iter().position(|t| *t == "subagent_done").unwrap();
        assert!(start_at < done_at);
    }

    // =========================================
    // Context pack
    // =========================================

    #[test]
    fn test_context_pack_targets_imports_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write("app/api.py", "from app import db\n").unwrap();
        ws.write("app/db.py", "session = None\n").unwrap();
        ws.write("app/helpers.py", "def helper(): pass\n").unwrap();
        ws.write("app/notes.md", "not code\n").unwrap();

        let pack = build_context_pack(&ws, &["app/api.py".to_string()], 10, 100_000);
        assert!(pack.contains_key("app/api.py"));
        assert!(pack.contains_key("app/db.py"), "import should resolve");
        assert!(pack.contains_key("app/helpers.py"), "sibling should join");
        assert!(!pack.contains_key("app/notes.md"), "non-code skipped");
    }

    #[test]
    fn test_context_pack_respects_char_budget() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write("target.py", &"t".repeat(500)).unwrap();
        ws.write("big_sibling.py", &"s".repeat(10_000)).unwrap();

        let pack = build_context_pack(&ws, &["target.py".to_string()], 10, 1_000);
        assert!(pack.contains_key("target.py"), "targets always included");
        assert!(!pack.contains_key("big_sibling.py"), "budget excludes sibling");
    }
}
