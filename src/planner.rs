//! Phase planner — one agentic session per phase over a tiny tool surface.
//!
//! The planner explores the workspace with `{read_file, list_directory}`
//! and terminates by calling `write_phase_plan(manifest, chunks)`. The
//! engine validates the plan structurally; violations go back as a
//! structured tool result so the model can repair and retry, bounded by
//! the iteration limit. Accepted plans are enriched (language, back-filled
//! depends_on/exports) and cached to `.forge/manifest_phase_<n>.json` so
//! resumes skip the planning call entirely.
//!
//! The same machinery drives the **recovery planner**: after a governance
//! FAIL it produces a fix manifest (entries carrying `fix_instructions`)
//! executed as a repair tier.

use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::contracts::ContractSnapshot;
use crate::errors::BuildError;
use crate::events::{Broadcaster, BuildEvent};
use crate::llm::{
    ContentBlock, LlmClient, Message, StreamItem, StreamRequest, StreamUsage, ToolCall,
};
use crate::manifest::{
    FileAction, ManifestEntry, PhasePlan, backfill_from_prior, save_manifest_cache,
    validate_and_enrich_plan,
};
use crate::phase::Phase;
use crate::subagent::extract_json_block;
use crate::tools::file_ops;
use crate::workspace::Workspace;

const PLANNER_MAX_TOKENS: u32 = 16_384;

const PLANNER_SYSTEM_PROMPT: &str = "\
You are the **Phase Planner** for the ForgeGuard build system.

Given a phase objective and its deliverables, produce the complete file
manifest and chunk breakdown for that phase.

You have three tools:
- list_directory(path) — survey the workspace
- read_file(path) — inspect existing files and interfaces
- write_phase_plan(manifest, chunks) — submit your final plan

Manifest rules:
- One entry per file: {path, action, purpose, estimated_lines, depends_on, exports}
- action is create, modify, or delete
- paths are project-relative with forward slashes
- depends_on lists paths WITHIN this phase the file needs built first
- exports lists the public symbols the file will define

Chunk rules:
- Each chunk: {name, files, work_order}
- work_order: {objective, constraints (max 4), patterns (max 2), success_criteria (max 3)}
- At most 6 files per chunk
- Every manifest file appears in exactly one chunk
- Test files go in a final, separate chunk

Explore first if you need to, then call write_phase_plan once you are
confident. If validation fails, fix every reported error and call it
again.";

/// The planner-only tool surface.
fn planner_tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "read_file",
            "description": "Read a file from the workspace.",
            "input_schema": {
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
            },
        }),
        json!({
            "name": "list_directory",
            "description": "List a workspace directory.",
            "input_schema": {
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
            },
        }),
        json!({
            "name": "write_phase_plan",
            "description": "Submit the final manifest and chunk breakdown for this phase.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "manifest": {"type": "array", "items": {"type": "object"}},
                    "chunks": {"type": "array", "items": {"type": "object"}},
                },
                "required": ["manifest", "chunks"],
            },
        }),
    ]
}

/// A finished planning session: the accepted plan plus what it cost.
#[derive(Debug)]
pub struct PlanOutcome {
    pub plan: PhasePlan,
    pub usage: StreamUsage,
}

/// Runs planning sessions for one build.
pub struct PhasePlanner {
    llm: Arc<LlmClient>,
    broadcaster: Arc<dyn Broadcaster>,
    workspace: Workspace,
    model: String,
    thinking_budget: u32,
    max_iterations: u32,
    cancel: CancellationToken,
}

impl PhasePlanner {
    pub fn new(
        llm: Arc<LlmClient>,
        broadcaster: Arc<dyn Broadcaster>,
        workspace: Workspace,
        model: &str,
        thinking_budget: u32,
        max_iterations: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            llm,
            broadcaster,
            workspace,
            model: model.to_string(),
            thinking_budget,
            max_iterations,
            cancel,
        }
    }

    fn system_blocks(&self, snapshot: &ContractSnapshot) -> Vec<String> {
        let mut blocks = vec![PLANNER_SYSTEM_PROMPT.to_string()];
        if !snapshot.is_empty() {
            blocks.push(format!(
                "=== PROJECT CONTRACTS ===\n\n{}",
                snapshot.as_markdown()
            ));
        }
        blocks
    }

    /// Run the agentic planning loop for one phase.
    pub async fn plan_phase(
        &self,
        build_id: Uuid,
        user_id: Uuid,
        snapshot: &ContractSnapshot,
        phase: &Phase,
        prior_phase_context: &str,
        prior_manifests: &[ManifestEntry],
    ) -> Result<PlanOutcome, BuildError> {
        let workspace_info = self.workspace.snapshot_markdown();
        let prior_section = if prior_phase_context.is_empty() {
            String::new()
        } else {
            format!("\n## Prior Phase Context\n{prior_phase_context}\n")
        };
        let initial_message = format!(
            "Plan the file manifest and chunk breakdown for the following phase.\n\n\
             {}\n\
             ## Current Workspace\n{}\n{}\
             INSTRUCTIONS:\n\
             1. Call list_directory(\".\") to survey the workspace root.\n\
             2. Read relevant existing files if you need to understand current interfaces.\n\
             3. When ready, call write_phase_plan with your complete manifest and chunks.\n\n\
             The manifest must cover ALL deliverables above. The builder will produce \
             no files beyond what you list.",
            phase.deliverables_text(),
            workspace_info,
            prior_section,
        );

        let system_blocks = self.system_blocks(snapshot);
        let tool_defs = planner_tool_definitions();
        let mut messages = vec![Message::user_text(&initial_message)];
        let mut usage_total = StreamUsage::default();
        let mut plan: Option<PhasePlan> = None;

        for iteration in 1..=self.max_iterations {
            if self.cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }

            self.broadcaster
                .send(
                    user_id,
                    BuildEvent::LlmThinking {
                        purpose: format!(
                            "Planning {}: manifest + chunks (turn {iteration})",
                            phase.label()
                        ),
                        model: self.model.clone(),
                        turn: iteration,
                        source: "planner".into(),
                        user_message_preview: initial_message.chars().take(800).collect(),
                        user_message_length: initial_message.len(),
                    },
                )
                .await;

            let request = StreamRequest {
                model: self.model.clone(),
                system_blocks: system_blocks.clone(),
                messages: messages.clone(),
                max_tokens: if self.thinking_budget > 0 {
                    PLANNER_MAX_TOKENS.max(self.thinking_budget + 4_096)
                } else {
                    PLANNER_MAX_TOKENS
                },
                tools: tool_defs.clone(),
                thinking_budget: self.thinking_budget,
            };

            let (tx, mut rx) = mpsc::channel(64);
            let llm = Arc::clone(&self.llm);
            let cancel = self.cancel.clone();
            let stream_task =
                tokio::spawn(async move { llm.stream(request, tx, None, Some(cancel)).await });

            let mut round_text = String::new();
            let mut thinking_text = String::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            while let Some(item) = rx.recv().await {
                match item {
                    StreamItem::Text(chunk) => round_text.push_str(&chunk),
                    StreamItem::Tool(call) => tool_calls.push(call),
                    StreamItem::Thinking(text) => thinking_text.push_str(&text),
                }
            }
            let usage = stream_task
                .await
                .map_err(|e| BuildError::Other(anyhow::anyhow!("planner stream panicked: {e}")))?
                .map_err(BuildError::Llm)?;
            accumulate(&mut usage_total, &usage);

            if !thinking_text.is_empty() {
                self.broadcaster
                    .send(
                        user_id,
                        BuildEvent::ThinkingBlock {
                            turn: iteration,
                            source: "planner".into(),
                            reasoning_text: thinking_text.chars().take(4_000).collect(),
                            reasoning_length: thinking_text.len(),
                        },
                    )
                    .await;
            }

            // Echo the assistant turn before dispatching tools.
            let mut assistant_blocks = Vec::new();
            if !round_text.is_empty() {
                assistant_blocks.push(ContentBlock::Text {
                    text: round_text.clone(),
                });
            }
            for call in &tool_calls {
                assistant_blocks.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                });
            }
            if !assistant_blocks.is_empty() {
                messages.push(Message::assistant_blocks(assistant_blocks));
            }

            // end_turn without write_phase_plan — protocol nudge.
            if tool_calls.is_empty() {
                tracing::warn!(turn = iteration, "planner ended turn without write_phase_plan");
                messages.push(Message::user_text(
                    "You did not call write_phase_plan. Please call it now with your \
                     complete manifest and chunks, or call read_file / list_directory \
                     if you need more information.",
                ));
                continue;
            }

            let mut result_blocks = Vec::new();
            for call in &tool_calls {
                self.broadcaster
                    .send(
                        user_id,
                        BuildEvent::BuildLog {
                            message: format!("Planner tool: {}", call.name),
                            source: "planner".into(),
                            level: "info".into(),
                        },
                    )
                    .await;

                let outcome = match call.name.as_str() {
                    "read_file" => file_ops::read_file(&call.input, &self.workspace)
                        .unwrap_or_else(|e| json!({"error": e.to_string()}).to_string()),
                    "list_directory" => file_ops::list_directory(&call.input, &self.workspace)
                        .unwrap_or_else(|e| json!({"error": e.to_string()}).to_string()),
                    "write_phase_plan" => {
                        let manifest_raw = call.input.get("manifest").cloned().unwrap_or(json!([]));
                        let chunks_raw = call.input.get("chunks").cloned().unwrap_or(json!([]));
                        match validate_and_enrich_plan(&manifest_raw, &chunks_raw) {
                            Ok(validated) => {
                                let counts = (validated.manifest.len(), validated.chunks.len());
                                plan = Some(validated);
                                json!({
                                    "success": true,
                                    "manifest_count": counts.0,
                                    "chunk_count": counts.1,
                                    "message": "Plan accepted.",
                                })
                                .to_string()
                            }
                            Err(errors) => {
                                tracing::warn!(?errors, "plan validation failed");
                                json!({
                                    "success": false,
                                    "errors": errors,
                                    "message": format!(
                                        "Plan validation failed ({} error(s)). \
                                         Fix all errors and call write_phase_plan again.",
                                        errors.len()
                                    ),
                                })
                                .to_string()
                            }
                        }
                    }
                    other => json!({"error": format!("Unknown tool: {other}")}).to_string(),
                };
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content: outcome,
                });
            }
            messages.push(Message::user_blocks(result_blocks));

            if let Some(mut accepted) = plan.take() {
                backfill_from_prior(&mut accepted.manifest, prior_manifests);
                if let Err(e) = save_manifest_cache(&self.workspace, phase.number, &accepted.manifest)
                {
                    return Err(BuildError::ManifestCacheWrite {
                        path: self.workspace.manifest_cache_path(phase.number),
                        source: e,
                    });
                }
                self.broadcaster
                    .send(
                        user_id,
                        BuildEvent::BuildLog {
                            message: format!(
                                "Plan accepted for {}: {} files in {} chunks",
                                phase.label(),
                                accepted.manifest.len(),
                                accepted.chunks.len()
                            ),
                            source: "planner".into(),
                            level: "info".into(),
                        },
                    )
                    .await;
                tracing::info!(build = %build_id, phase = phase.number, "phase plan accepted");
                return Ok(PlanOutcome {
                    plan: accepted,
                    usage: usage_total,
                });
            }
        }

        Err(BuildError::PlanningFailed {
            phase: phase.number,
            reason: format!(
                "no valid plan after {} iterations",
                self.max_iterations
            ),
        })
    }

    /// After a governance FAIL, one bounded planner round producing a fix
    /// manifest: `{files: [{path, fix_instructions}]}` parsed from the
    /// response tail. Entries come back as `modify` actions carrying
    /// their instructions.
    pub async fn plan_recovery(
        &self,
        user_id: Uuid,
        phase: &Phase,
        failure_context: &str,
        touched_files: &[String],
    ) -> Result<(Vec<ManifestEntry>, StreamUsage), BuildError> {
        let message = format!(
            "The governance gate blocked {} with these failures:\n\n{}\n\n\
             Touched files this phase:\n{}\n\n\
             Produce a minimal fix plan. Respond with ONLY a JSON object:\n\
             {{\"files\": [{{\"path\": \"...\", \"fix_instructions\": \"...\"}}]}}\n\
             List only files that need changes to clear the failures.",
            phase.label(),
            failure_context,
            touched_files
                .iter()
                .map(|f| format!("- {f}"))
                .collect::<Vec<_>>()
                .join("\n"),
        );

        let request = StreamRequest::new(
            &self.model,
            PLANNER_SYSTEM_PROMPT,
            vec![Message::user_text(&message)],
            4_096,
        );

        let (tx, mut rx) = mpsc::channel(64);
        let llm = Arc::clone(&self.llm);
        let cancel = self.cancel.clone();
        let stream_task =
            tokio::spawn(async move { llm.stream(request, tx, None, Some(cancel)).await });

        let mut text = String::new();
        while let Some(item) = rx.recv().await {
            if let StreamItem::Text(chunk) = item {
                text.push_str(&chunk);
            }
        }
        let usage = stream_task
            .await
            .map_err(|e| BuildError::Other(anyhow::anyhow!("recovery stream panicked: {e}")))?
            .map_err(BuildError::Llm)?;

        let parsed = extract_json_block(&text);
        let mut entries = Vec::new();
        for item in parsed["files"].as_array().into_iter().flatten() {
            let path = item["path"].as_str().unwrap_or("");
            if path.is_empty() {
                continue;
            }
            let mut entry = ManifestEntry::new(path, FileAction::Modify, "governance fix", 40);
            entry.fix_instructions = item["fix_instructions"].as_str().map(str::to_string);
            entries.push(entry);
        }

        self.broadcaster
            .send(
                user_id,
                BuildEvent::RecoveryPlan {
                    phase: phase.label(),
                    fix_files: entries.iter().map(|e| e.path.clone()).collect(),
                },
            )
            .await;

        Ok((entries, usage))
    }
}

fn accumulate(total: &mut StreamUsage, delta: &StreamUsage) {
    total.input_tokens += delta.input_tokens;
    total.output_tokens += delta.output_tokens;
    total.cache_read_input_tokens += delta.cache_read_input_tokens;
    total.cache_creation_input_tokens += delta.cache_creation_input_tokens;
    if !delta.model.is_empty() {
        total.model = delta.model.clone();
    }
}
