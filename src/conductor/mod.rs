//! Build conductor — the top-level state machine for one build.
//!
//! ```text
//! pending → running            (start)
//! running → paused             (N consecutive failures, gate open)
//! paused  → running            (resume: retry | skip | edit)
//! paused  → cancelled          (resume: abort)
//! running → completed          (terminal phase passes)
//! running → failed             (unhandled error, cost cap, stall)
//! running → cancelled          (user cancel)
//! ```
//!
//! The conductor owns a [`BuildHandle`] — the single home for everything
//! the old module-level maps used to hold: gate slots, the pause slot,
//! the interjection FIFO, the stop token, and the progress counter the
//! watchdog observes. Control-plane calls (commence, approve, resume,
//! interject, answer) all go through the handle.
//!
//! Every terminal transition emits exactly one of `build_complete`,
//! `build_error`, or `build_cancelled`.

pub mod watchdog;

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ForgeConfig;
use crate::contracts::{ContractSnapshot, ContractStore, ContractType, materialise_contracts};
use crate::cost::{CostLedger, estimate_phase_cost};
use crate::errors::{BuildError, ToolError};
use crate::events::{Broadcaster, BuildEvent};
use crate::governance::run_governance_checks;
use crate::limiter::ApiKeyPool;
use crate::llm::{LlmClient, LlmEndpoint};
use crate::manifest::{
    FileAction, ManifestEntry, PhasePlan, chunks_from_tiers, compute_tiers, load_manifest_cache,
    save_manifest_cache,
};
use crate::phase::{Phase, parse_phases_contract};
use crate::planner::PhasePlanner;
use crate::store::{Build, BuildStatus, BuildStore};
use crate::subagent::SubAgentRunner;
use crate::tier::{TierExecutor, TierLessons};
use crate::tools::{Clarifier, Scratchpad, ToolContext};
use crate::workspace::Workspace;

pub use watchdog::spawn_watchdog;

/// The sentinel answer a timed-out clarification returns.
pub const CLARIFICATION_SENTINEL: &str = "proceed with best judgement";

// ---------------------------------------------------------------------------
// Control-plane types
// ---------------------------------------------------------------------------

/// User-interactive suspension points, one slot per kind per build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateKind {
    IdeReady,
    PlanReview,
    PhaseReview,
    Clarification,
}

/// The action consumed when a paused build resumes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ResumeAction {
    Retry,
    Skip,
    Abort,
    Edit { manifest: Value },
}

/// Shared control surface for one build. The conductor's sub-tasks and
/// the host's control endpoints both reach the build through this handle;
/// there are no global mutable maps.
pub struct BuildHandle {
    pub build_id: Uuid,
    pub user_id: Uuid,
    cancel: CancellationToken,
    stalled: AtomicBool,
    stall_info: Mutex<Option<(u64, String)>>,
    base: tokio::time::Instant,
    last_progress_ms: AtomicU64,
    turn: AtomicU64,
    activity: Mutex<String>,
    gates: Mutex<HashMap<GateKind, oneshot::Sender<Value>>>,
    pause: Mutex<Option<oneshot::Sender<ResumeAction>>>,
    interjections: Mutex<VecDeque<String>>,
    clarifications_asked: AtomicU32,
}

impl BuildHandle {
    pub fn new(build_id: Uuid, user_id: Uuid) -> Self {
        Self {
            build_id,
            user_id,
            cancel: CancellationToken::new(),
            stalled: AtomicBool::new(false),
            stall_info: Mutex::new(None),
            base: tokio::time::Instant::now(),
            last_progress_ms: AtomicU64::new(0),
            turn: AtomicU64::new(0),
            activity: Mutex::new(String::new()),
            gates: Mutex::new(HashMap::new()),
            pause: Mutex::new(None),
            interjections: Mutex::new(VecDeque::new()),
            clarifications_asked: AtomicU32::new(0),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// User cancel: honoured at every suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    /// Called by the watchdog only.
    pub fn flag_stall(&self, idle_secs: u64, activity: &str) {
        self.stalled.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.stall_info.try_lock() {
            *guard = Some((idle_secs, activity.to_string()));
        }
        self.cancel.cancel();
    }

    pub async fn stall_info(&self) -> Option<(u64, String)> {
        self.stall_info.lock().await.clone()
    }

    /// Record a progress heartbeat so the watchdog knows we are alive.
    pub fn touch_progress(&self) {
        let elapsed = self.base.elapsed().as_millis() as u64;
        self.last_progress_ms.store(elapsed, Ordering::SeqCst);
    }

    pub fn idle_seconds(&self) -> u64 {
        let now = self.base.elapsed().as_millis() as u64;
        let last = self.last_progress_ms.load(Ordering::SeqCst);
        now.saturating_sub(last) / 1_000
    }

    /// Strictly monotonic turn counter for `build_turn` events.
    pub fn next_turn(&self) -> u64 {
        self.turn.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn set_activity(&self, status: &str) {
        *self.activity.lock().await = status.to_string();
        self.touch_progress();
    }

    pub async fn activity(&self) -> String {
        self.activity.lock().await.clone()
    }

    /// Open a gate of `kind`, replacing (and thereby closing) any prior
    /// slot of the same kind. One writer, one reader.
    pub async fn open_gate(&self, kind: GateKind) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().await.insert(kind, tx);
        rx
    }

    pub async fn gate_open(&self, kind: GateKind) -> bool {
        self.gates.lock().await.contains_key(&kind)
    }

    pub async fn close_gate(&self, kind: GateKind) {
        self.gates.lock().await.remove(&kind);
    }

    /// Deliver a user response to an open gate. Returns false when no
    /// gate of that kind is waiting.
    pub async fn resolve_gate(&self, kind: GateKind, response: Value) -> bool {
        match self.gates.lock().await.remove(&kind) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Open the pause slot (one per build).
    pub async fn open_pause(&self) -> oneshot::Receiver<ResumeAction> {
        let (tx, rx) = oneshot::channel();
        *self.pause.lock().await = Some(tx);
        rx
    }

    pub async fn pause_open(&self) -> bool {
        self.pause.lock().await.is_some()
    }

    /// Deliver the resume action to a paused build.
    pub async fn resume(&self, action: ResumeAction) -> bool {
        match self.pause.lock().await.take() {
            Some(tx) => tx.send(action).is_ok(),
            None => false,
        }
    }

    /// Queue a free-text interjection, drained between LLM turns.
    pub async fn interject(&self, text: &str) {
        self.interjections.lock().await.push_back(text.to_string());
    }

    pub async fn drain_interjections(&self) -> Vec<String> {
        self.interjections.lock().await.drain(..).collect()
    }

    pub fn clarifications_asked(&self) -> u32 {
        self.clarifications_asked.load(Ordering::SeqCst)
    }
}

/// Clarification bridge: opens the clarification gate, enforces the
/// per-build limit, and falls back to the sentinel answer on timeout.
pub struct GateClarifier {
    handle: Arc<BuildHandle>,
    broadcaster: Arc<dyn Broadcaster>,
    limit: u32,
    timeout: Duration,
}

impl GateClarifier {
    pub fn new(
        handle: Arc<BuildHandle>,
        broadcaster: Arc<dyn Broadcaster>,
        limit: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            handle,
            broadcaster,
            limit,
            timeout,
        }
    }
}

#[async_trait]
impl Clarifier for GateClarifier {
    async fn ask(&self, question: &str) -> Result<String, ToolError> {
        let asked = self.handle.clarifications_asked.fetch_add(1, Ordering::SeqCst) + 1;
        if asked > self.limit {
            return Err(ToolError::ClarificationLimit(self.limit));
        }

        let rx = self.handle.open_gate(GateKind::Clarification).await;
        let question_id = Uuid::new_v4().to_string();
        self.broadcaster
            .send(
                self.handle.user_id,
                BuildEvent::ClarificationRequested {
                    question_id,
                    question: question.to_string(),
                    asked_count: asked,
                    limit: self.limit,
                },
            )
            .await;
        self.handle.touch_progress();

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => {
                self.handle.touch_progress();
                Ok(response["answer"]
                    .as_str()
                    .unwrap_or(CLARIFICATION_SENTINEL)
                    .to_string())
            }
            _ => {
                self.handle.close_gate(GateKind::Clarification).await;
                Ok(CLARIFICATION_SENTINEL.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// /pull resume seeding
// ---------------------------------------------------------------------------

/// Parse commit messages for `forge: Phase <n> complete` markers; the
/// highest such phase seeds `resume_from`.
pub fn parse_phase_completions<'a>(messages: impl Iterator<Item = &'a str>) -> Option<u32> {
    let re = regex::Regex::new(r"forge: Phase (\d+) complete").expect("static regex");
    messages
        .filter_map(|m| {
            re.captures(m)
                .and_then(|c| c[1].parse::<u32>().ok())
        })
        .max()
}

/// Walk the workspace repository's commit log for completion markers.
/// No repository, no history — start from the beginning.
pub fn resume_phase_from_git(workspace: &Workspace) -> Option<u32> {
    let repo = git2::Repository::open(workspace.root()).ok()?;
    let mut walk = repo.revwalk().ok()?;
    walk.push_head().ok()?;
    let messages: Vec<String> = walk
        .filter_map(|oid| oid.ok())
        .filter_map(|oid| repo.find_commit(oid).ok())
        .filter_map(|commit| commit.message().map(str::to_string))
        .collect();
    parse_phase_completions(messages.iter().map(String::as_str))
}

// ---------------------------------------------------------------------------
// The conductor
// ---------------------------------------------------------------------------

enum FinalState {
    Completed,
    Cancelled,
}

enum PhaseOutcome {
    Advance,
    Retry,
    Skip,
    Aborted,
}

/// Static inputs for starting one build.
pub struct ConductorParams {
    pub config: ForgeConfig,
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub workspace: Workspace,
    pub branch: String,
    /// User-supplied cap; falls back to the server cap in config.
    pub spend_cap: Option<f64>,
}

/// Drives one build from `pending` to a terminal state.
pub struct BuildConductor {
    config: ForgeConfig,
    store: Arc<dyn BuildStore>,
    broadcaster: Arc<dyn Broadcaster>,
    workspace: Workspace,
    build: Build,
    handle: Arc<BuildHandle>,
    snapshot: ContractSnapshot,
    phases: Vec<Phase>,
    ledger: Arc<CostLedger>,
    planner: PhasePlanner,
    tier_executor: TierExecutor,
}

impl BuildConductor {
    /// Capture contracts, parse phases, persist the build row, and wire
    /// up the execution stack. The build is left `pending`; `run` moves
    /// it to `running`.
    pub async fn prepare(
        params: ConductorParams,
        contracts: Arc<dyn ContractStore>,
        store: Arc<dyn BuildStore>,
        broadcaster: Arc<dyn Broadcaster>,
        endpoint: Arc<dyn LlmEndpoint>,
    ) -> Result<Self, BuildError> {
        let all = contracts.all_contracts(params.project_id).await?;
        let snapshot = ContractSnapshot::capture(all);

        let phases_contract =
            snapshot
                .get(ContractType::Phases)
                .ok_or(BuildError::ContractMissing {
                    contract_type: "phases".into(),
                })?;
        let phases = parse_phases_contract(phases_contract.unfenced_content());
        if phases.is_empty() {
            return Err(BuildError::EmptyPhasesContract);
        }

        materialise_contracts(params.workspace.root(), &snapshot)
            .map_err(|e| BuildError::Other(anyhow::anyhow!("contract materialisation: {e}")))?;

        let build = Build::new(
            params.project_id,
            params.user_id,
            &params.workspace.root().to_string_lossy(),
            &params.branch,
        );
        store.insert_build(build.clone()).await?;

        let handle = Arc::new(BuildHandle::new(build.id, params.user_id));
        handle.touch_progress();

        let keys = if params.config.llm.api_keys.is_empty() {
            tracing::warn!("no API keys configured; using placeholder key");
            vec!["unset".to_string()]
        } else {
            params.config.llm.api_keys.clone()
        };
        let pool = Arc::new(ApiKeyPool::new(
            &keys,
            params.config.llm.input_tpm,
            params.config.llm.output_tpm,
        )?);
        let llm = Arc::new(LlmClient::new(endpoint, pool));

        let effective_cap = params.spend_cap.or(if params.config.budget.max_cost_usd > 0.0 {
            Some(params.config.budget.max_cost_usd)
        } else {
            None
        });
        let ledger = Arc::new(CostLedger::new(
            build.id,
            params.user_id,
            effective_cap,
            params.config.budget.warn_pct,
            Duration::from_secs(params.config.budget.ticker_interval_secs),
            broadcaster.clone(),
            store.clone(),
        ));

        let clarifier = Arc::new(GateClarifier::new(
            handle.clone(),
            broadcaster.clone(),
            params.config.clarification.max_per_build,
            Duration::from_secs(params.config.clarification.timeout_secs),
        ));
        let tool_ctx = ToolContext {
            workspace: params.workspace.clone(),
            project_id: params.project_id,
            contracts,
            snapshot: snapshot.clone(),
            phases: phases.clone(),
            scratchpad: Arc::new(Scratchpad::new()),
            clarifier: Some(clarifier),
        };

        let runner = Arc::new(
            SubAgentRunner::new(
                llm.clone(),
                tool_ctx,
                broadcaster.clone(),
                &params.config.llm.builder_model,
                &params.config.llm.planner_model,
                handle.cancel_token().clone(),
            )
            .with_max_tool_rounds(params.config.build.max_tool_rounds),
        );

        let planner = PhasePlanner::new(
            llm,
            broadcaster.clone(),
            params.workspace.clone(),
            &params.config.llm.planner_model,
            params.config.llm.thinking_budget,
            params.config.build.max_planner_iterations,
            handle.cancel_token().clone(),
        );

        let tier_executor = TierExecutor::new(
            runner,
            ledger.clone(),
            broadcaster.clone(),
            store.clone(),
            params.workspace.clone(),
            build.id,
            params.user_id,
            params.config.build.tier_concurrency,
            params.config.audit.trivial_file_max_chars,
            handle.cancel_token().clone(),
        );

        Ok(Self {
            config: params.config,
            store,
            broadcaster,
            workspace: params.workspace,
            build,
            handle,
            snapshot,
            phases,
            ledger,
            planner,
            tier_executor,
        })
    }

    /// The control surface for this build.
    pub fn handle(&self) -> Arc<BuildHandle> {
        self.handle.clone()
    }

    pub fn build_id(&self) -> Uuid {
        self.build.id
    }

    /// Drive the build to a terminal state. Exactly one terminal event is
    /// emitted.
    pub async fn run(&self) -> BuildStatus {
        let watchdog = spawn_watchdog(
            self.handle.clone(),
            self.broadcaster.clone(),
            self.store.clone(),
            self.config.watchdog.clone(),
            self.build.id,
            self.build.user_id,
        );

        let outcome = self.main_loop().await;
        watchdog.abort();

        match outcome {
            Ok(FinalState::Completed) => {
                let cost = self.ledger.running_cost().await;
                let _ = self
                    .store
                    .update_status(
                        self.build.id,
                        BuildStatus::Completed,
                        Some(chrono::Utc::now()),
                        None,
                    )
                    .await;
                self.broadcaster
                    .send(
                        self.build.user_id,
                        BuildEvent::BuildComplete {
                            build_id: self.build.id,
                            phases_completed: self.phases.len(),
                            total_cost_usd: cost.round_dp(4).to_string(),
                        },
                    )
                    .await;
                BuildStatus::Completed
            }
            Ok(FinalState::Cancelled) => self.finish_cancelled().await,
            Err(error) => {
                if self.handle.stalled() {
                    let (idle, activity) = self
                        .handle
                        .stall_info()
                        .await
                        .unwrap_or((0, "processing".into()));
                    return self
                        .finish_failed(&format!(
                            "Build stalled: no progress for {idle}s while {activity}"
                        ))
                        .await;
                }
                if matches!(error, BuildError::Cancelled) {
                    return self.finish_cancelled().await;
                }
                let mut detail = error.to_string();
                detail.truncate(500);
                self.finish_failed(&detail).await
            }
        }
    }

    async fn finish_cancelled(&self) -> BuildStatus {
        let _ = self
            .store
            .update_status(
                self.build.id,
                BuildStatus::Cancelled,
                Some(chrono::Utc::now()),
                None,
            )
            .await;
        self.broadcaster
            .send(
                self.build.user_id,
                BuildEvent::BuildCancelled {
                    build_id: self.build.id,
                },
            )
            .await;
        BuildStatus::Cancelled
    }

    async fn finish_failed(&self, detail: &str) -> BuildStatus {
        let _ = self
            .store
            .update_status(
                self.build.id,
                BuildStatus::Failed,
                Some(chrono::Utc::now()),
                Some(detail.to_string()),
            )
            .await;
        let _ = self
            .store
            .append_log(self.build.id, &format!("Build failed: {detail}"), "system", "error")
            .await;
        self.broadcaster
            .send(
                self.build.user_id,
                BuildEvent::BuildError {
                    build_id: self.build.id,
                    status: "failed".into(),
                    error_detail: detail.to_string(),
                },
            )
            .await;
        BuildStatus::Failed
    }

    async fn main_loop(&self) -> Result<FinalState, BuildError> {
        self.store
            .update_status(self.build.id, BuildStatus::Running, None, None)
            .await?;
        self.handle.touch_progress();

        // -- IDE-ready gate: await commence before planning starts -------
        // The slot opens before the event goes out so a fast responder
        // cannot race the gate.
        let rx = self.handle.open_gate(GateKind::IdeReady).await;
        self.handle.touch_progress();
        self.broadcaster
            .send(
                self.build.user_id,
                BuildEvent::IdeReady {
                    working_dir: self.workspace.root().to_string_lossy().to_string(),
                },
            )
            .await;
        let response = self.wait_gate_response(rx).await?;
        if response["action"].as_str() == Some("cancel") {
            return Ok(FinalState::Cancelled);
        }

        let resume_after = resume_phase_from_git(&self.workspace);
        let mut index = match resume_after {
            Some(done) => self
                .phases
                .iter()
                .position(|p| p.number > done)
                .unwrap_or(self.phases.len()),
            None => 0,
        };
        if index > 0 {
            self.store
                .append_log(
                    self.build.id,
                    &format!("Resuming from phase index {index} (commit log markers)"),
                    "system",
                    "info",
                )
                .await?;
        }

        let mut prior_manifests: Vec<ManifestEntry> = Vec::new();
        let mut prior_written: BTreeMap<String, String> = BTreeMap::new();
        let mut user_guidance = String::new();
        let mut overview_sent = false;
        let mut consecutive_failures: u32 = 0;

        while index < self.phases.len() {
            if self.handle.cancel_token().is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            let phase = &self.phases[index];
            match self
                .run_phase(
                    phase,
                    &mut prior_manifests,
                    &mut prior_written,
                    &mut user_guidance,
                    &mut overview_sent,
                    &mut consecutive_failures,
                )
                .await?
            {
                PhaseOutcome::Advance => {
                    consecutive_failures = 0;
                    index += 1;
                }
                PhaseOutcome::Skip => {
                    consecutive_failures = 0;
                    self.store
                        .append_log(
                            self.build.id,
                            &format!("{} skipped by user", phase.label()),
                            "system",
                            "warn",
                        )
                        .await?;
                    index += 1;
                }
                PhaseOutcome::Retry => {}
                PhaseOutcome::Aborted => return Ok(FinalState::Cancelled),
            }
        }

        Ok(FinalState::Completed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phase(
        &self,
        phase: &Phase,
        prior_manifests: &mut Vec<ManifestEntry>,
        prior_written: &mut BTreeMap<String, String>,
        user_guidance: &mut String,
        overview_sent: &mut bool,
        consecutive_failures: &mut u32,
    ) -> Result<PhaseOutcome, BuildError> {
        self.broadcaster
            .send(
                self.build.user_id,
                BuildEvent::BuildTurn {
                    turn: self.handle.next_turn(),
                },
            )
            .await;
        self.broadcaster
            .send(
                self.build.user_id,
                BuildEvent::PhaseStart {
                    phase: phase.number,
                    name: phase.name.clone(),
                    total_phases: self.phases.len(),
                },
            )
            .await;
        self.store
            .update_phase(self.build.id, &phase.label(), *consecutive_failures)
            .await?;
        self.set_activity(&format!("Planning {}", phase.label())).await;

        // -- Plan (manifest cache short-circuits the LLM call) -----------
        let mut plan = match load_manifest_cache(&self.workspace, phase.number) {
            Some(manifest) => {
                self.store
                    .append_log(
                        self.build.id,
                        &format!("Using cached manifest for {}", phase.label()),
                        "planner",
                        "info",
                    )
                    .await?;
                let tiers = compute_tiers(&manifest);
                PhasePlan {
                    chunks: chunks_from_tiers(&tiers),
                    manifest,
                }
            }
            None => {
                let prior_context = render_prior_context(prior_written);
                let outcome = self
                    .planner
                    .plan_phase(
                        self.build.id,
                        self.build.user_id,
                        &self.snapshot,
                        phase,
                        &prior_context,
                        prior_manifests,
                    )
                    .await?;
                self.ledger
                    .record_usage(&phase.label(), &outcome.usage)
                    .await?;
                outcome.plan
            }
        };
        self.handle.touch_progress();

        let tiers = compute_tiers(&plan.manifest);
        if !*overview_sent {
            *overview_sent = true;
            self.broadcaster
                .send(
                    self.build.user_id,
                    BuildEvent::BuildOverview {
                        phase: phase.number,
                        manifest_files: plan.manifest.len(),
                        chunks: plan.chunks.len(),
                        tiers: tiers.len(),
                    },
                )
                .await;
        }

        // -- Plan-review gate: approve | reject | edit --------------------
        loop {
            let estimate = estimate_phase_cost(
                &plan.manifest,
                &plan.chunks,
                self.ledger.running_cost().await,
                self.ledger.cap(),
            );
            let rx = self.handle.open_gate(GateKind::PlanReview).await;
            self.handle.touch_progress();
            self.broadcaster
                .send(
                    self.build.user_id,
                    BuildEvent::PlanReview {
                        phase: phase.number,
                        manifest: serde_json::to_value(&plan.manifest).unwrap_or_default(),
                        chunks: serde_json::to_value(&plan.chunks).unwrap_or_default(),
                        estimate,
                    },
                )
                .await;
            let response = self.wait_gate_response(rx).await?;
            match response["action"].as_str() {
                Some("approve") => break,
                Some("reject") => {
                    return Err(BuildError::PlanRejected {
                        reason: response["reason"].as_str().map(str::to_string),
                    });
                }
                Some("edit") => {
                    // Apply the user's manifest deltas, then re-emit.
                    apply_manifest_edit(&mut plan, &response["manifest"]);
                    save_manifest_cache(&self.workspace, phase.number, &plan.manifest).map_err(
                        |e| BuildError::ManifestCacheWrite {
                            path: self.workspace.manifest_cache_path(phase.number),
                            source: e,
                        },
                    )?;
                }
                _ => break, // malformed response treated as approve
            }
        }

        // -- Tiers ---------------------------------------------------------
        let tiers = compute_tiers(&plan.manifest);
        let mut touched: BTreeSet<String> = BTreeSet::new();
        let mut lessons = TierLessons::default();
        let mut failing: Vec<String> = Vec::new();

        for (tier_index, tier) in tiers.iter().enumerate() {
            self.drain_interjections(user_guidance).await;
            let contracts_text = self.contracts_text(user_guidance);
            self.broadcaster
                .send(
                    self.build.user_id,
                    BuildEvent::BuildTurn {
                        turn: self.handle.next_turn(),
                    },
                )
                .await;
            self.set_activity(&format!(
                "{} — tier {tier_index} ({} files)",
                phase.label(),
                tier.len()
            ))
            .await;

            let outcome = self
                .tier_executor
                .execute_tier(
                    tier_index,
                    tier,
                    phase,
                    &contracts_text,
                    prior_written,
                    &lessons,
                )
                .await?;

            for (path, content) in outcome.files_written {
                touched.insert(path.clone());
                prior_written.insert(path, content);
            }
            failing.extend(outcome.failing_files);
            lessons = outcome.lessons;
            self.handle.touch_progress();
        }

        // -- Governance gate ----------------------------------------------
        self.set_activity(&format!("Governance gate — {}", phase.label()))
            .await;
        let mut report =
            run_governance_checks(&self.workspace, &self.snapshot, &plan.manifest, &touched);
        self.broadcast_governance(phase, &report).await;

        // -- Recovery planner round on FAIL -------------------------------
        if !report.passed {
            let touched_list: Vec<String> = touched.iter().cloned().collect();
            let (fix_entries, usage) = self
                .planner
                .plan_recovery(
                    self.build.user_id,
                    phase,
                    &report.failure_context(),
                    &touched_list,
                )
                .await?;
            self.ledger.record_usage(&phase.label(), &usage).await?;

            if !fix_entries.is_empty() {
                let contracts_text = self.contracts_text(user_guidance);
                let outcome = self
                    .tier_executor
                    .execute_tier(
                        tiers.len(),
                        &fix_entries,
                        phase,
                        &contracts_text,
                        prior_written,
                        &lessons,
                    )
                    .await?;
                for (path, content) in outcome.files_written {
                    touched.insert(path.clone());
                    prior_written.insert(path, content);
                }
                failing.extend(outcome.failing_files);
            }

            report =
                run_governance_checks(&self.workspace, &self.snapshot, &plan.manifest, &touched);
            self.broadcast_governance(phase, &report).await;
        }

        // Only a PASSing gate resets the consecutive-failure counter.
        if !report.passed {
            *consecutive_failures += 1;
            self.store
                .update_phase(self.build.id, &phase.label(), *consecutive_failures)
                .await?;
            if *consecutive_failures >= self.config.build.pause_threshold {
                return self
                    .pause_and_wait(
                        phase,
                        *consecutive_failures,
                        &format!(
                            "{} governance failures: {}",
                            report.blocking_failures,
                            report.failure_context()
                        ),
                    )
                    .await;
            }
            return Ok(PhaseOutcome::Retry);
        }

        // -- Phase-review gate on partial success -------------------------
        if !failing.is_empty() {
            let rx = self.handle.open_gate(GateKind::PhaseReview).await;
            self.handle.touch_progress();
            self.broadcaster
                .send(
                    self.build.user_id,
                    BuildEvent::PhaseReview {
                        phase: phase.number,
                        failing_files: failing.clone(),
                    },
                )
                .await;
            let response = self.wait_gate_response(rx).await?;
            if response["action"].as_str() == Some("fix") {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.build.pause_threshold {
                    return self
                        .pause_and_wait(
                            phase,
                            *consecutive_failures,
                            &format!("{} files still failing after fixers", failing.len()),
                        )
                        .await;
                }
                return Ok(PhaseOutcome::Retry);
            }
            // continue — accept the partial phase.
        }

        prior_manifests.extend(plan.manifest.clone());
        self.write_progress_snapshot(phase, prior_written.len());
        self.store
            .append_log(
                self.build.id,
                &format!("{} complete — {} files touched", phase.label(), touched.len()),
                "system",
                "info",
            )
            .await?;
        Ok(PhaseOutcome::Advance)
    }

    /// Persist the pause, open the pause slot, and map the resume action
    /// onto the state machine.
    async fn pause_and_wait(
        &self,
        phase: &Phase,
        loop_count: u32,
        reason: &str,
    ) -> Result<PhaseOutcome, BuildError> {
        self.store
            .pause_build(self.build.id, reason, &phase.label())
            .await?;
        self.store
            .append_log(
                self.build.id,
                &format!("Build paused: {reason}"),
                "system",
                "warn",
            )
            .await?;

        let rx = self.handle.open_pause().await;
        self.broadcaster
            .send(
                self.build.user_id,
                BuildEvent::BuildPaused {
                    phase: phase.label(),
                    loop_count,
                    reason: reason.to_string(),
                    options: vec!["retry".into(), "skip".into(), "abort".into(), "edit".into()],
                },
            )
            .await;
        self.handle.touch_progress();

        let action = tokio::select! {
            action = rx => action.map_err(|_| BuildError::Cancelled)?,
            _ = self.handle.cancel_token().cancelled() => return Err(BuildError::Cancelled),
        };
        self.handle.touch_progress();

        let action_name = match &action {
            ResumeAction::Retry => "retry",
            ResumeAction::Skip => "skip",
            ResumeAction::Abort => "abort",
            ResumeAction::Edit { .. } => "edit",
        };
        self.broadcaster
            .send(
                self.build.user_id,
                BuildEvent::BuildResumed {
                    action: action_name.into(),
                },
            )
            .await;

        match action {
            ResumeAction::Abort => Ok(PhaseOutcome::Aborted),
            ResumeAction::Skip => {
                self.store
                    .update_status(self.build.id, BuildStatus::Running, None, None)
                    .await?;
                Ok(PhaseOutcome::Skip)
            }
            ResumeAction::Retry => {
                self.store
                    .update_status(self.build.id, BuildStatus::Running, None, None)
                    .await?;
                Ok(PhaseOutcome::Retry)
            }
            ResumeAction::Edit { manifest } => {
                if let Some(mut cached) = load_manifest_cache(&self.workspace, phase.number) {
                    merge_manifest_entries(&mut cached, &manifest);
                    save_manifest_cache(&self.workspace, phase.number, &cached).map_err(|e| {
                        BuildError::ManifestCacheWrite {
                            path: self.workspace.manifest_cache_path(phase.number),
                            source: e,
                        }
                    })?;
                }
                self.store
                    .update_status(self.build.id, BuildStatus::Running, None, None)
                    .await?;
                Ok(PhaseOutcome::Retry)
            }
        }
    }

    async fn wait_gate_response(
        &self,
        rx: oneshot::Receiver<Value>,
    ) -> Result<Value, BuildError> {
        tokio::select! {
            response = rx => response.map_err(|_| BuildError::Cancelled),
            _ = self.handle.cancel_token().cancelled() => Err(BuildError::Cancelled),
        }
    }

    async fn set_activity(&self, status: &str) {
        self.handle.set_activity(status).await;
        self.broadcaster
            .send(
                self.build.user_id,
                BuildEvent::BuildActivityStatus {
                    status: status.to_string(),
                    model: String::new(),
                },
            )
            .await;
    }

    /// Drain the interjection FIFO into the guidance block prepended to
    /// subsequent sub-agent context.
    async fn drain_interjections(&self, user_guidance: &mut String) {
        for text in self.handle.drain_interjections().await {
            self.broadcaster
                .send(
                    self.build.user_id,
                    BuildEvent::BuildInterjection { text: text.clone() },
                )
                .await;
            user_guidance.push_str(&format!("- {text}\n"));
        }
    }

    /// Free-form per-build progress snapshot under `.forge/progress.json`.
    fn write_progress_snapshot(&self, phase: &Phase, files_built: usize) {
        let snapshot = json!({
            "build_id": self.build.id,
            "last_completed_phase": phase.number,
            "phase_name": phase.name,
            "total_phases": self.phases.len(),
            "files_built": files_built,
            "updated_at": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.workspace.ensure_forge_dir().and_then(|_| {
            std::fs::write(
                self.workspace.progress_path(),
                serde_json::to_string_pretty(&snapshot).unwrap_or_default(),
            )
        }) {
            tracing::debug!(error = %e, "could not write progress snapshot");
        }
    }

    fn contracts_text(&self, user_guidance: &str) -> String {
        let mut text = self.snapshot.as_markdown();
        if !user_guidance.is_empty() {
            text.push_str(&format!("\n## User Guidance (interjected)\n{user_guidance}"));
        }
        text
    }

    async fn broadcast_governance(&self, phase: &Phase, report: &crate::governance::GovernanceReport) {
        for check in &report.checks {
            self.broadcaster
                .send(
                    self.build.user_id,
                    BuildEvent::GovernanceCheck {
                        code: check.code.clone(),
                        name: check.name.clone(),
                        result: check.result.clone(),
                        detail: check.detail.clone(),
                        phase: phase.label(),
                    },
                )
                .await;
        }
        let summary = format!(
            "Governance gate: {} PASS, {} FAIL, {} WARN",
            report.checks.len() - report.blocking_failures - report.warnings,
            report.blocking_failures,
            report.warnings
        );
        let _ = self
            .store
            .append_log(
                self.build.id,
                &summary,
                "governance",
                if report.passed { "info" } else { "warn" },
            )
            .await;
        let event = if report.passed {
            BuildEvent::GovernancePass {
                phase: phase.label(),
                warnings: report.warnings,
            }
        } else {
            BuildEvent::GovernanceFail {
                phase: phase.label(),
                blocking_failures: report.blocking_failures,
                warnings: report.warnings,
            }
        };
        self.broadcaster.send(self.build.user_id, event).await;
    }
}

/// Render prior-phase context for the planner: completed files and their
/// exported symbols.
fn render_prior_context(prior_written: &BTreeMap<String, String>) -> String {
    if prior_written.is_empty() {
        return String::new();
    }
    let mut out = String::from("Files built in prior phases:\n");
    for (path, content) in prior_written {
        let exports = crate::scout::extract_exports(path, content);
        if exports.is_empty() {
            out.push_str(&format!("- {path}\n"));
        } else {
            out.push_str(&format!("- {path}: {}\n", exports.join(", ")));
        }
    }
    out
}

/// Replace the plan's manifest with user-edited entries where valid.
fn apply_manifest_edit(plan: &mut PhasePlan, edited: &Value) {
    let Some(entries) = edited.as_array() else {
        return;
    };
    let parsed: Vec<ManifestEntry> = entries
        .iter()
        .filter_map(|e| serde_json::from_value(e.clone()).ok())
        .collect();
    if parsed.is_empty() {
        return;
    }
    let tiers = compute_tiers(&parsed);
    plan.chunks = chunks_from_tiers(&tiers);
    plan.manifest = parsed;
}

/// Merge user-supplied manifest entries into a cached manifest by path.
fn merge_manifest_entries(cached: &mut Vec<ManifestEntry>, edited: &Value) {
    let Some(entries) = edited.as_array() else {
        return;
    };
    for raw in entries {
        let Ok(entry) = serde_json::from_value::<ManifestEntry>(raw.clone()) else {
            continue;
        };
        match cached.iter_mut().find(|c| c.path == entry.path) {
            Some(existing) => *existing = entry,
            None => cached.push(entry),
        }
    }
}
