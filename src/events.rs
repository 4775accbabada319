//! Typed build events and the `Broadcaster` fan-out contract.
//!
//! Every observable moment of a build is one `BuildEvent` variant; the
//! wire shape is `{"type": "<snake_case_name>", ...payload fields}`. The
//! conductor emits events in order and the broadcaster must deliver them
//! to the owning user in that order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

/// Governance check verdict carried by `governance_check` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckResult {
    Pass,
    Fail,
    Warn,
}

/// One typed event. Progress, LLM, file lifecycle, sub-agent, gate,
/// governance, and terminal groups — see the variant names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildEvent {
    // -- Progress ---------------------------------------------------------
    BuildLog {
        message: String,
        source: String,
        level: String,
    },
    BuildActivityStatus {
        status: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        model: String,
    },
    BuildTurn {
        turn: u64,
    },
    PhaseStart {
        phase: u32,
        name: String,
        total_phases: usize,
    },
    TierStart {
        tier: usize,
        files: Vec<String>,
    },
    TierComplete {
        tier: usize,
        files_written: usize,
    },
    BuildOverview {
        phase: u32,
        manifest_files: usize,
        chunks: usize,
        tiers: usize,
    },

    // -- LLM --------------------------------------------------------------
    LlmThinking {
        purpose: String,
        model: String,
        turn: u32,
        source: String,
        user_message_preview: String,
        user_message_length: usize,
    },
    ThinkingBlock {
        turn: u32,
        source: String,
        reasoning_text: String,
        reasoning_length: usize,
    },
    BuildInterjection {
        text: String,
    },
    CostTicker {
        total_cost_usd: String,
        api_calls: u64,
        tokens_in: u64,
        tokens_out: u64,
        spend_cap: Option<String>,
        pct_used: f64,
        model_tokens: Value,
    },
    CostWarning {
        total_cost_usd: String,
        spend_cap: String,
        pct_used: f64,
        message: String,
    },
    CostExceeded {
        total_cost_usd: String,
        spend_cap: String,
        message: String,
    },

    // -- File lifecycle ---------------------------------------------------
    FileGenerating {
        path: String,
        phase: String,
    },
    FileGenerated {
        path: String,
        phase: String,
        bytes: usize,
    },
    FileFixing {
        path: String,
        findings: usize,
    },
    FileFixed {
        path: String,
    },
    FileAudited {
        path: String,
        verdict: String,
        findings: usize,
    },

    // -- Sub-agent --------------------------------------------------------
    SubagentStart {
        role: String,
        handoff_id: String,
        files: Vec<String>,
        assignment: String,
    },
    SubagentDone {
        role: String,
        handoff_id: String,
        status: String,
        files_written: Vec<String>,
        duration_s: f64,
        tokens: u64,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        error: String,
    },
    SonnetReview {
        scope: String,
        verdict: String,
    },
    ScratchpadWrite {
        key: String,
        source: String,
        role: String,
        summary: String,
        content: String,
        full_length: usize,
    },
    ToolUse {
        role: String,
        tool: String,
        detail: String,
    },

    // -- Gates ------------------------------------------------------------
    BuildPaused {
        phase: String,
        loop_count: u32,
        reason: String,
        options: Vec<String>,
    },
    BuildResumed {
        action: String,
    },
    PlanReview {
        phase: u32,
        manifest: Value,
        chunks: Value,
        estimate: Value,
    },
    PhaseReview {
        phase: u32,
        failing_files: Vec<String>,
    },
    IdeReady {
        working_dir: String,
    },
    ClarificationRequested {
        question_id: String,
        question: String,
        asked_count: u32,
        limit: u32,
    },

    // -- Governance -------------------------------------------------------
    GovernanceCheck {
        code: String,
        name: String,
        result: CheckResult,
        detail: String,
        phase: String,
    },
    GovernancePass {
        phase: String,
        warnings: usize,
    },
    GovernanceFail {
        phase: String,
        blocking_failures: usize,
        warnings: usize,
    },

    // -- Terminal ---------------------------------------------------------
    BuildComplete {
        build_id: Uuid,
        phases_completed: usize,
        total_cost_usd: String,
    },
    BuildError {
        build_id: Uuid,
        status: String,
        error_detail: String,
    },
    BuildCancelled {
        build_id: Uuid,
    },
    RecoveryPlan {
        phase: String,
        fix_files: Vec<String>,
    },
}

impl BuildEvent {
    /// The wire-level type tag, e.g. "file_generated".
    pub fn type_name(&self) -> &'static str {
        match self {
            BuildEvent::BuildLog { .. } => "build_log",
            BuildEvent::BuildActivityStatus { .. } => "build_activity_status",
            BuildEvent::BuildTurn { .. } => "build_turn",
            BuildEvent::PhaseStart { .. } => "phase_start",
            BuildEvent::TierStart { .. } => "tier_start",
            BuildEvent::TierComplete { .. } => "tier_complete",
            BuildEvent::BuildOverview { .. } => "build_overview",
            BuildEvent::LlmThinking { .. } => "llm_thinking",
            BuildEvent::ThinkingBlock { .. } => "thinking_block",
            BuildEvent::BuildInterjection { .. } => "build_interjection",
            BuildEvent::CostTicker { .. } => "cost_ticker",
            BuildEvent::CostWarning { .. } => "cost_warning",
            BuildEvent::CostExceeded { .. } => "cost_exceeded",
            BuildEvent::FileGenerating { .. } => "file_generating",
            BuildEvent::FileGenerated { .. } => "file_generated",
            BuildEvent::FileFixing { .. } => "file_fixing",
            BuildEvent::FileFixed { .. } => "file_fixed",
            BuildEvent::FileAudited { .. } => "file_audited",
            BuildEvent::SubagentStart { .. } => "subagent_start",
            BuildEvent::SubagentDone { .. } => "subagent_done",
            BuildEvent::SonnetReview { .. } => "sonnet_review",
            BuildEvent::ScratchpadWrite { .. } => "scratchpad_write",
            BuildEvent::ToolUse { .. } => "tool_use",
            BuildEvent::BuildPaused { .. } => "build_paused",
            BuildEvent::BuildResumed { .. } => "build_resumed",
            BuildEvent::PlanReview { .. } => "plan_review",
            BuildEvent::PhaseReview { .. } => "phase_review",
            BuildEvent::IdeReady { .. } => "ide_ready",
            BuildEvent::ClarificationRequested { .. } => "clarification_requested",
            BuildEvent::GovernanceCheck { .. } => "governance_check",
            BuildEvent::GovernancePass { .. } => "governance_pass",
            BuildEvent::GovernanceFail { .. } => "governance_fail",
            BuildEvent::BuildComplete { .. } => "build_complete",
            BuildEvent::BuildError { .. } => "build_error",
            BuildEvent::BuildCancelled { .. } => "build_cancelled",
            BuildEvent::RecoveryPlan { .. } => "recovery_plan",
        }
    }
}

/// Delivers typed events to one user. Implementations must preserve the
/// per-build emission order.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn send(&self, user_id: Uuid, event: BuildEvent);
}

/// Channel-backed broadcaster: one unbounded mpsc per subscribed user.
/// Events to users without a subscription are dropped (fire-and-forget,
/// like an absent WebSocket).
#[derive(Default)]
pub struct ChannelBroadcaster {
    subscribers: Mutex<HashMap<Uuid, mpsc::UnboundedSender<BuildEvent>>>,
}

impl ChannelBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a user; returns the receiving half. A second subscribe
    /// replaces the first (latest connection wins).
    pub async fn subscribe(&self, user_id: Uuid) -> mpsc::UnboundedReceiver<BuildEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.insert(user_id, tx);
        rx
    }
}

#[async_trait]
impl Broadcaster for ChannelBroadcaster {
    async fn send(&self, user_id: Uuid, event: BuildEvent) {
        let guard = self.subscribers.lock().await;
        if let Some(tx) = guard.get(&user_id) {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape_has_type_tag() {
        let event = BuildEvent::FileGenerated {
            path: "src/main.py".into(),
            phase: "Phase 1".into(),
            bytes: 120,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "file_generated");
        assert_eq!(json["path"], "src/main.py");
        assert_eq!(json["bytes"], 120);
    }

    #[test]
    fn test_type_name_matches_serde_tag() {
        let events = vec![
            BuildEvent::BuildTurn { turn: 1 },
            BuildEvent::GovernancePass {
                phase: "Phase 1".into(),
                warnings: 0,
            },
            BuildEvent::ClarificationRequested {
                question_id: "q1".into(),
                question: "Which DB?".into(),
                asked_count: 1,
                limit: 10,
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.type_name());
        }
    }

    #[test]
    fn test_check_result_serialises_uppercase() {
        let event = BuildEvent::GovernanceCheck {
            code: "G1".into(),
            name: "Scope compliance".into(),
            result: CheckResult::Fail,
            detail: "phantom files".into(),
            phase: "Phase 1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["result"], "FAIL");
    }

    #[tokio::test]
    async fn test_channel_broadcaster_preserves_order() {
        let broadcaster = ChannelBroadcaster::new();
        let user = Uuid::new_v4();
        let mut rx = broadcaster.subscribe(user).await;

        for turn in 1..=3 {
            broadcaster.send(user, BuildEvent::BuildTurn { turn }).await;
        }

        for expected in 1..=3u64 {
            match rx.recv().await.unwrap() {
                BuildEvent::BuildTurn { turn } => assert_eq!(turn, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_send_without_subscriber_is_dropped() {
        let broadcaster = ChannelBroadcaster::new();
        // No panic, no error — fire and forget.
        broadcaster
            .send(Uuid::new_v4(), BuildEvent::BuildTurn { turn: 1 })
            .await;
    }
}
