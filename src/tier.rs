//! Tier executor — bounded-concurrency file pipelines, the batch auditor,
//! and fixer dispatch.
//!
//! For one tier (files whose cross-dependencies are satisfied), the
//! executor builds a deterministic scout context, runs the Coder pipeline
//! per file behind a semaphore, then a single batch Auditor call over the
//! tier's non-trivial files, then one Fixer per failing file. Lessons
//! (confirmed fixes, unsafe patterns, export summaries) accumulate across
//! files and carry into later tiers.
//!
//! Ordering guarantee: every `file_generated` of a tier is emitted before
//! any `file_audited` of that tier — the auditor only runs once every
//! pipeline has finished.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cost::CostLedger;
use crate::errors::BuildError;
use crate::events::{Broadcaster, BuildEvent};
use crate::manifest::ManifestEntry;
use crate::phase::Phase;
use crate::scout::{build_scout_context, extract_exports, merged_symbols};
use crate::store::{BuildStore, FileLog};
use crate::subagent::{Handoff, SubAgentRole, SubAgentRunner, build_context_pack};
use crate::workspace::Workspace;

/// Lessons learned inside a tier, carried forward to later files and
/// tiers as extra context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierLessons {
    pub confirmed_fixes: Vec<String>,
    pub unsafe_patterns: Vec<String>,
    pub export_summaries: BTreeMap<String, Vec<String>>,
}

impl TierLessons {
    pub fn is_empty(&self) -> bool {
        self.confirmed_fixes.is_empty()
            && self.unsafe_patterns.is_empty()
            && self.export_summaries.is_empty()
    }

    fn as_context(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Lessons From This Build\n");
        if !self.confirmed_fixes.is_empty() {
            out.push_str("Confirmed fixes:\n");
            for fix in &self.confirmed_fixes {
                out.push_str(&format!("- {fix}\n"));
            }
        }
        if !self.unsafe_patterns.is_empty() {
            out.push_str("Patterns that failed audit (avoid these):\n");
            for pattern in &self.unsafe_patterns {
                out.push_str(&format!("- {pattern}\n"));
            }
        }
        if !self.export_summaries.is_empty() {
            out.push_str("Completed files and their exports:\n");
            for (path, exports) in &self.export_summaries {
                out.push_str(&format!("- {path}: {}\n", exports.join(", ")));
            }
        }
        out
    }
}

/// One per-file audit verdict out of the batch call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditVerdict {
    pub path: String,
    pub verdict: String,
    #[serde(default)]
    pub findings: Vec<AuditFinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditFinding {
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub message: String,
}

/// What one tier produced.
#[derive(Debug, Default)]
pub struct TierOutcome {
    /// Path → content as read back from disk.
    pub files_written: BTreeMap<String, String>,
    /// Files still failing after fixers ran.
    pub failing_files: Vec<String>,
    pub lessons: TierLessons,
}

/// Runs tiers for one build.
pub struct TierExecutor {
    runner: Arc<SubAgentRunner>,
    ledger: Arc<CostLedger>,
    broadcaster: Arc<dyn Broadcaster>,
    store: Arc<dyn BuildStore>,
    workspace: Workspace,
    build_id: Uuid,
    user_id: Uuid,
    concurrency: usize,
    trivial_max_chars: usize,
    cancel: CancellationToken,
}

impl TierExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: Arc<SubAgentRunner>,
        ledger: Arc<CostLedger>,
        broadcaster: Arc<dyn Broadcaster>,
        store: Arc<dyn BuildStore>,
        workspace: Workspace,
        build_id: Uuid,
        user_id: Uuid,
        concurrency: usize,
        trivial_max_chars: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            ledger,
            broadcaster,
            store,
            workspace,
            build_id,
            user_id,
            concurrency,
            trivial_max_chars,
            cancel,
        }
    }

    /// Execute one tier end to end.
    pub async fn execute_tier(
        &self,
        tier_index: usize,
        tier_files: &[ManifestEntry],
        phase: &Phase,
        contracts_text: &str,
        prior_written: &BTreeMap<String, String>,
        lessons_in: &TierLessons,
    ) -> Result<TierOutcome, BuildError> {
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let paths: Vec<String> = tier_files.iter().map(|e| e.path.clone()).collect();
        self.broadcaster
            .send(
                self.user_id,
                BuildEvent::TierStart {
                    tier: tier_index,
                    files: paths.clone(),
                },
            )
            .await;

        let scout_context = build_scout_context(&self.workspace, tier_files, prior_written);
        let mut lessons = lessons_in.clone();

        // -- Coder pipelines, bounded by the semaphore --------------------
        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let mut tasks = Vec::new();
        for entry in tier_files.iter().cloned() {
            let permit_source = Arc::clone(&semaphore);
            let runner = Arc::clone(&self.runner);
            let broadcaster = Arc::clone(&self.broadcaster);
            let workspace = self.workspace.clone();
            let cancel = self.cancel.clone();
            let scout_json = scout_context.to_string();
            let lessons_text = lessons.as_context();
            let contracts_text = contracts_text.to_string();
            let phase_label = phase.label();
            let deliverables = phase.deliverables_text();
            let build_id = self.build_id;
            let user_id = self.user_id;

            tasks.push(tokio::spawn(async move {
                let _permit = permit_source.acquire().await.expect("semaphore closed");
                if cancel.is_cancelled() {
                    return (entry, None);
                }

                broadcaster
                    .send(
                        user_id,
                        BuildEvent::FileGenerating {
                            path: entry.path.clone(),
                            phase: phase_label.clone(),
                        },
                    )
                    .await;

                let handoff = build_file_handoff(
                    &entry,
                    build_id,
                    user_id,
                    &workspace,
                    &contracts_text,
                    &deliverables,
                    &scout_json,
                    &lessons_text,
                );
                let result = runner.run(handoff).await;
                (entry, Some(result))
            }));
        }

        let mut written: BTreeMap<String, String> = BTreeMap::new();
        for task in tasks {
            let (entry, maybe_result) = task
                .await
                .map_err(|e| BuildError::Other(anyhow::anyhow!("pipeline task panicked: {e}")))?;
            let Some(result) = maybe_result else {
                continue; // cancelled before start
            };

            // Cost recording may trip the cap — that unwinds the tier.
            self.ledger
                .record_usage(&phase.label(), &result.usage)
                .await?;

            if result.succeeded()
                && let Ok(content) = self.workspace.read(&entry.path)
            {
                self.broadcaster
                    .send(
                        self.user_id,
                        BuildEvent::FileGenerated {
                            path: entry.path.clone(),
                            phase: phase.label(),
                            bytes: content.len(),
                        },
                    )
                    .await;
                self.store
                    .record_file_log(
                        self.build_id,
                        FileLog {
                            at: chrono::Utc::now(),
                            path: entry.path.clone(),
                            action: "generated".into(),
                            phase: phase.label(),
                        },
                    )
                    .await?;
                let exports = extract_exports(&entry.path, &content);
                if !exports.is_empty() {
                    lessons.export_summaries.insert(entry.path.clone(), exports);
                }
                written.insert(entry.path.clone(), content);
            }
        }

        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        // -- Per-file integration check -----------------------------------
        // Refuse files that reference symbols not exported anywhere in the
        // merged (prior + this tier) map; refusals become audit findings.
        let mut prior_exports: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (path, content) in prior_written {
            prior_exports.insert(path.clone(), extract_exports(path, content));
        }
        let merged = merged_symbols(&[&prior_exports, &lessons.export_summaries]);
        let mut forced_findings: BTreeMap<String, Vec<AuditFinding>> = BTreeMap::new();
        for (path, content) in &written {
            for symbol in unresolved_references(content, &written, prior_written, &merged) {
                forced_findings.entry(path.clone()).or_default().push(AuditFinding {
                    line: 0,
                    severity: "error".into(),
                    message: format!("references '{symbol}' which is not exported anywhere"),
                });
            }
        }

        // -- Batch audit ---------------------------------------------------
        let mut verdicts = self
            .run_batch_audit(phase, contracts_text, &written)
            .await?;
        for (path, findings) in forced_findings {
            match verdicts.iter_mut().find(|v| v.path == path) {
                Some(verdict) => {
                    verdict.verdict = "FAIL".into();
                    verdict.findings.extend(findings);
                }
                None => verdicts.push(AuditVerdict {
                    path,
                    verdict: "FAIL".into(),
                    findings,
                }),
            }
        }

        for verdict in &verdicts {
            self.broadcaster
                .send(
                    self.user_id,
                    BuildEvent::FileAudited {
                        path: verdict.path.clone(),
                        verdict: verdict.verdict.clone(),
                        findings: verdict.findings.len(),
                    },
                )
                .await;
            if verdict.verdict == "FAIL" {
                for finding in &verdict.findings {
                    lessons
                        .unsafe_patterns
                        .push(format!("{}: {}", verdict.path, finding.message));
                }
            }
        }
        let audit_fails = verdicts.iter().filter(|v| v.verdict == "FAIL").count();
        self.broadcaster
            .send(
                self.user_id,
                BuildEvent::SonnetReview {
                    scope: format!("tier {tier_index}"),
                    verdict: if audit_fails == 0 {
                        "PASS".to_string()
                    } else {
                        format!("{audit_fails} file(s) failing")
                    },
                },
            )
            .await;

        // -- Fixers for failures -------------------------------------------
        let mut failing = Vec::new();
        let failures: Vec<AuditVerdict> = verdicts
            .iter()
            .filter(|v| v.verdict == "FAIL")
            .cloned()
            .collect();
        for failure in failures {
            if self.cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            self.broadcaster
                .send(
                    self.user_id,
                    BuildEvent::FileFixing {
                        path: failure.path.clone(),
                        findings: failure.findings.len(),
                    },
                )
                .await;

            let fixed = self
                .run_fixer(phase, &failure, &mut lessons, &mut written)
                .await?;
            if fixed {
                self.broadcaster
                    .send(
                        self.user_id,
                        BuildEvent::FileFixed {
                            path: failure.path.clone(),
                        },
                    )
                    .await;
            } else {
                failing.push(failure.path.clone());
            }
        }

        self.broadcaster
            .send(
                self.user_id,
                BuildEvent::TierComplete {
                    tier: tier_index,
                    files_written: written.len(),
                },
            )
            .await;

        Ok(TierOutcome {
            files_written: written,
            failing_files: failing,
            lessons,
        })
    }

    /// One Auditor handoff reviewing all non-trivial files in the tier.
    /// Trivial files (short, or recognisable test stubs) are auto-passed
    /// without spending tokens on them.
    async fn run_batch_audit(
        &self,
        phase: &Phase,
        contracts_text: &str,
        written: &BTreeMap<String, String>,
    ) -> Result<Vec<AuditVerdict>, BuildError> {
        let mut verdicts = Vec::new();
        let mut to_review: BTreeMap<&String, &String> = BTreeMap::new();
        for (path, content) in written {
            if is_trivial_file(path, content, self.trivial_max_chars) {
                verdicts.push(AuditVerdict {
                    path: path.clone(),
                    verdict: "PASS".into(),
                    findings: Vec::new(),
                });
            } else {
                to_review.insert(path, content);
            }
        }
        if to_review.is_empty() {
            return Ok(verdicts);
        }

        let mut assignment = String::from(
            "Review every file below for structural problems. Output one verdict per file.\n",
        );
        let mut handoff = Handoff::new(
            SubAgentRole::Auditor,
            self.build_id,
            self.user_id,
            &assignment,
        );
        for (path, content) in &to_review {
            handoff
                .context_files
                .insert((*path).clone(), (*content).clone());
        }
        assignment.push_str("\nFiles under review:\n");
        for path in to_review.keys() {
            assignment.push_str(&format!("- {path}\n"));
        }
        handoff.assignment = assignment;
        handoff.contracts_text = contracts_text.to_string();

        let result = self.runner.run(handoff).await;
        self.ledger.record_usage(&phase.label(), &result.usage).await?;

        let parsed = parse_audit_verdicts(&result.structured_output);
        if parsed.is_empty() && !result.succeeded() {
            // An auditor that died reviews nothing — treat all files as
            // failing so the fixer path can still run.
            for path in to_review.keys() {
                verdicts.push(AuditVerdict {
                    path: (*path).clone(),
                    verdict: "FAIL".into(),
                    findings: vec![AuditFinding {
                        line: 0,
                        severity: "error".into(),
                        message: format!("audit did not complete: {}", result.error),
                    }],
                });
            }
            return Ok(verdicts);
        }

        // Files the auditor skipped pass by default.
        for path in to_review.keys() {
            match parsed.iter().find(|v| &v.path == *path) {
                Some(verdict) => verdicts.push(verdict.clone()),
                None => verdicts.push(AuditVerdict {
                    path: (*path).clone(),
                    verdict: "PASS".into(),
                    findings: Vec::new(),
                }),
            }
        }
        Ok(verdicts)
    }

    /// Dispatch one Fixer for a failed file. Returns whether the fix
    /// completed; the fixed content is re-read from disk into `written`.
    async fn run_fixer(
        &self,
        phase: &Phase,
        failure: &AuditVerdict,
        lessons: &mut TierLessons,
        written: &mut BTreeMap<String, String>,
    ) -> Result<bool, BuildError> {
        let findings_text = failure
            .findings
            .iter()
            .map(|f| format!("line {}: [{}] {}", f.line, f.severity, f.message))
            .collect::<Vec<_>>()
            .join("\n");

        let mut handoff = Handoff::new(
            SubAgentRole::Fixer,
            self.build_id,
            self.user_id,
            &format!("Fix the audit findings in `{}`.", failure.path),
        );
        handoff.files = vec![failure.path.clone()];
        handoff.error_context = findings_text;
        if let Some(content) = written.get(&failure.path) {
            handoff
                .context_files
                .insert(failure.path.clone(), content.clone());
        }

        let result = self.runner.run(handoff).await;
        self.ledger.record_usage(&phase.label(), &result.usage).await?;

        if !result.succeeded() {
            return Ok(false);
        }

        if let Ok(content) = self.workspace.read(&failure.path) {
            let exports = extract_exports(&failure.path, &content);
            if !exports.is_empty() {
                lessons
                    .export_summaries
                    .insert(failure.path.clone(), exports);
            }
            written.insert(failure.path.clone(), content);
        }
        for finding in &failure.findings {
            lessons
                .confirmed_fixes
                .push(format!("{}: {}", failure.path, finding.message));
        }
        Ok(true)
    }
}

/// Build the Coder (or, for recovery entries, Fixer) handoff for one file.
#[allow(clippy::too_many_arguments)]
fn build_file_handoff(
    entry: &ManifestEntry,
    build_id: Uuid,
    user_id: Uuid,
    workspace: &Workspace,
    contracts_text: &str,
    deliverables: &str,
    scout_json: &str,
    lessons_text: &str,
) -> Handoff {
    let role = if entry.fix_instructions.is_some() {
        SubAgentRole::Fixer
    } else {
        SubAgentRole::Coder
    };

    let mut assignment = format!(
        "Build `{}` ({}). Purpose: {}\nEstimated size: ~{} lines.",
        entry.path,
        entry.language,
        if entry.purpose.is_empty() {
            "see deliverables"
        } else {
            &entry.purpose
        },
        entry.estimated_lines,
    );
    if !entry.exports.is_empty() {
        assignment.push_str(&format!("\nPlanned exports: {}", entry.exports.join(", ")));
    }
    if !entry.depends_on.is_empty() {
        assignment.push_str(&format!(
            "\nDepends on (already built): {}",
            entry.depends_on.join(", ")
        ));
    }
    assignment.push_str(&format!("\n\n## Workspace Digest\n{scout_json}"));
    if !lessons_text.is_empty() {
        assignment.push_str(&format!("\n\n{lessons_text}"));
    }

    let mut handoff = Handoff::new(role, build_id, user_id, &assignment);
    handoff.files = vec![entry.path.clone()];
    handoff.contracts_text = contracts_text.to_string();
    handoff.phase_deliverables = deliverables.to_string();
    handoff.context_files = build_context_pack(workspace, &handoff.files, 12, 60_000);
    if let Some(instructions) = &entry.fix_instructions {
        handoff.error_context = instructions.clone();
    }
    handoff
}

/// Trivial files bypass the batch auditor: nearly-empty files and test
/// stubs with no executable statements.
pub fn is_trivial_file(path: &str, content: &str, max_chars: usize) -> bool {
    if content.trim().len() < max_chars {
        return true;
    }
    let name = path.rsplit('/').next().unwrap_or(path);
    let looks_like_test = name.starts_with("test_") || name.contains("_test.");
    if looks_like_test {
        let has_logic = content.lines().any(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty()
                && !trimmed.starts_with('#')
                && !trimmed.starts_with("import ")
                && !trimmed.starts_with("from ")
        });
        return !has_logic;
    }
    name == "__init__.py" && content.trim().lines().count() <= 2
}

/// Parse `{files: [{path, verdict, findings}]}` out of the auditor's
/// structured output. Unknown shapes produce an empty list.
pub fn parse_audit_verdicts(output: &Value) -> Vec<AuditVerdict> {
    let Some(files) = output.get("files").and_then(|f| f.as_array()) else {
        return Vec::new();
    };
    files
        .iter()
        .filter_map(|item| serde_json::from_value::<AuditVerdict>(item.clone()).ok())
        .filter(|v| !v.path.is_empty())
        .collect()
}

/// Symbols a file references via internal `from X import Y` lines that no
/// file in the merged map exports.
fn unresolved_references(
    content: &str,
    tier_written: &BTreeMap<String, String>,
    prior_written: &BTreeMap<String, String>,
    merged: &BTreeSet<String>,
) -> Vec<String> {
    let import_re =
        regex::Regex::new(r"(?m)^\s*from\s+([\w.]+)\s+import\s+([\w,\s]+)").expect("static regex");
    let mut unresolved = Vec::new();

    let internal_module = |module: &str| -> bool {
        let path = format!("{}.py", module.replace('.', "/"));
        tier_written.contains_key(&path) || prior_written.contains_key(&path)
    };

    for caps in import_re.captures_iter(content) {
        let module = &caps[1];
        if !internal_module(module) {
            continue;
        }
        for symbol in caps[2].split(',') {
            let symbol = symbol.trim();
            if symbol.is_empty() || symbol == "*" {
                continue;
            }
            if !merged.contains(symbol) && !unresolved.contains(&symbol.to_string()) {
                unresolved.push(symbol.to_string());
            }
        }
    }
    unresolved
}
