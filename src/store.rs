//! Build rows and durable logging — the `BuildStore` contract.
//!
//! The engine persists build state through this narrow trait; what sits
//! behind it (a database, a file, memory) is the host application's
//! concern. `MemoryBuildStore` ships for the CLI's local mode and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::BuildError;

/// Build lifecycle states. Transitions are owned exclusively by the
/// conductor of that build (see the state diagram in conductor::).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Completed | BuildStatus::Cancelled | BuildStatus::Failed
        )
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Paused => "paused",
            BuildStatus::Completed => "completed",
            BuildStatus::Cancelled => "cancelled",
            BuildStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Execution mode for a build. Only plan-execute is implemented; the
/// enum leaves room for host-defined modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    #[default]
    PlanExecute,
}

/// One build row — identity plus the mutable fields the conductor owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub project_id: Uuid,
    pub user_id: Uuid,
    pub status: BuildStatus,
    pub current_phase: String,
    /// Consecutive audit/governance failures within the current phase.
    pub loop_count: u32,
    pub branch_name: String,
    pub working_dir: String,
    pub build_mode: BuildMode,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    pub pause_reason: Option<String>,
}

impl Build {
    pub fn new(project_id: Uuid, user_id: Uuid, working_dir: &str, branch_name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            user_id,
            status: BuildStatus::Pending,
            current_phase: String::new(),
            loop_count: 0,
            branch_name: branch_name.to_string(),
            working_dir: working_dir.to_string(),
            build_mode: BuildMode::default(),
            started_at: Utc::now(),
            completed_at: None,
            error_detail: None,
            pause_reason: None,
        }
    }
}

/// One append-only activity log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
    pub source: String,
    pub level: String,
}

/// Per-phase cost record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCost {
    pub phase: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub cost_usd: Decimal,
}

/// Per-file generation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLog {
    pub at: DateTime<Utc>,
    pub path: String,
    pub action: String,
    pub phase: String,
}

/// Durable persistence surface for builds. Log appends are ordered per
/// build; row updates are transactional per row.
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn insert_build(&self, build: Build) -> Result<(), BuildError>;

    async fn get_build(&self, build_id: Uuid) -> Result<Option<Build>, BuildError>;

    async fn update_status(
        &self,
        build_id: Uuid,
        status: BuildStatus,
        completed_at: Option<DateTime<Utc>>,
        error_detail: Option<String>,
    ) -> Result<(), BuildError>;

    async fn update_phase(
        &self,
        build_id: Uuid,
        phase: &str,
        loop_count: u32,
    ) -> Result<(), BuildError>;

    async fn pause_build(
        &self,
        build_id: Uuid,
        reason: &str,
        phase: &str,
    ) -> Result<(), BuildError>;

    async fn record_phase_cost(&self, build_id: Uuid, cost: PhaseCost) -> Result<(), BuildError>;

    async fn record_file_log(&self, build_id: Uuid, log: FileLog) -> Result<(), BuildError>;

    async fn append_log(
        &self,
        build_id: Uuid,
        message: &str,
        source: &str,
        level: &str,
    ) -> Result<(), BuildError>;
}

#[derive(Default)]
struct MemoryStoreInner {
    builds: HashMap<Uuid, Build>,
    logs: HashMap<Uuid, Vec<LogEntry>>,
    phase_costs: HashMap<Uuid, Vec<PhaseCost>>,
    file_logs: HashMap<Uuid, Vec<FileLog>>,
}

/// In-memory `BuildStore` for local runs and tests.
#[derive(Default)]
pub struct MemoryBuildStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryBuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn logs(&self, build_id: Uuid) -> Vec<LogEntry> {
        let guard = self.inner.lock().await;
        guard.logs.get(&build_id).cloned().unwrap_or_default()
    }

    pub async fn phase_costs(&self, build_id: Uuid) -> Vec<PhaseCost> {
        let guard = self.inner.lock().await;
        guard.phase_costs.get(&build_id).cloned().unwrap_or_default()
    }

    pub async fn file_logs(&self, build_id: Uuid) -> Vec<FileLog> {
        let guard = self.inner.lock().await;
        guard.file_logs.get(&build_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl BuildStore for MemoryBuildStore {
    async fn insert_build(&self, build: Build) -> Result<(), BuildError> {
        let mut guard = self.inner.lock().await;
        guard.builds.insert(build.id, build);
        Ok(())
    }

    async fn get_build(&self, build_id: Uuid) -> Result<Option<Build>, BuildError> {
        let guard = self.inner.lock().await;
        Ok(guard.builds.get(&build_id).cloned())
    }

    async fn update_status(
        &self,
        build_id: Uuid,
        status: BuildStatus,
        completed_at: Option<DateTime<Utc>>,
        error_detail: Option<String>,
    ) -> Result<(), BuildError> {
        let mut guard = self.inner.lock().await;
        if let Some(build) = guard.builds.get_mut(&build_id) {
            build.status = status;
            if completed_at.is_some() {
                build.completed_at = completed_at;
            }
            if error_detail.is_some() {
                build.error_detail = error_detail;
            }
        }
        Ok(())
    }

    async fn update_phase(
        &self,
        build_id: Uuid,
        phase: &str,
        loop_count: u32,
    ) -> Result<(), BuildError> {
        let mut guard = self.inner.lock().await;
        if let Some(build) = guard.builds.get_mut(&build_id) {
            build.current_phase = phase.to_string();
            build.loop_count = loop_count;
        }
        Ok(())
    }

    async fn pause_build(
        &self,
        build_id: Uuid,
        reason: &str,
        phase: &str,
    ) -> Result<(), BuildError> {
        let mut guard = self.inner.lock().await;
        if let Some(build) = guard.builds.get_mut(&build_id) {
            build.status = BuildStatus::Paused;
            build.pause_reason = Some(reason.to_string());
            build.current_phase = phase.to_string();
        }
        Ok(())
    }

    async fn record_phase_cost(&self, build_id: Uuid, cost: PhaseCost) -> Result<(), BuildError> {
        let mut guard = self.inner.lock().await;
        guard.phase_costs.entry(build_id).or_default().push(cost);
        Ok(())
    }

    async fn record_file_log(&self, build_id: Uuid, log: FileLog) -> Result<(), BuildError> {
        let mut guard = self.inner.lock().await;
        guard.file_logs.entry(build_id).or_default().push(log);
        Ok(())
    }

    async fn append_log(
        &self,
        build_id: Uuid,
        message: &str,
        source: &str,
        level: &str,
    ) -> Result<(), BuildError> {
        let mut guard = self.inner.lock().await;
        guard.logs.entry(build_id).or_default().push(LogEntry {
            at: Utc::now(),
            message: message.to_string(),
            source: source.to_string(),
            level: level.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_build() -> Build {
        Build::new(Uuid::new_v4(), Uuid::new_v4(), "/tmp/project", "forge/build-1")
    }

    #[test]
    fn test_status_terminality() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(!BuildStatus::Paused.is_terminal());
        assert!(BuildStatus::Completed.is_terminal());
        assert!(BuildStatus::Cancelled.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
    }

    #[tokio::test]
    async fn test_insert_and_update_status() {
        let store = MemoryBuildStore::new();
        let build = make_build();
        let id = build.id;
        store.insert_build(build).await.unwrap();

        store
            .update_status(id, BuildStatus::Running, None, None)
            .await
            .unwrap();
        assert_eq!(
            store.get_build(id).await.unwrap().unwrap().status,
            BuildStatus::Running
        );

        let now = Utc::now();
        store
            .update_status(id, BuildStatus::Failed, Some(now), Some("boom".into()))
            .await
            .unwrap();
        let fetched = store.get_build(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, BuildStatus::Failed);
        assert_eq!(fetched.error_detail.as_deref(), Some("boom"));
        assert!(fetched.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_pause_records_reason_and_phase() {
        let store = MemoryBuildStore::new();
        let build = make_build();
        let id = build.id;
        store.insert_build(build).await.unwrap();

        store
            .pause_build(id, "3 consecutive audit failures", "Phase 2")
            .await
            .unwrap();
        let fetched = store.get_build(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, BuildStatus::Paused);
        assert_eq!(
            fetched.pause_reason.as_deref(),
            Some("3 consecutive audit failures")
        );
        assert_eq!(fetched.current_phase, "Phase 2");
    }

    #[tokio::test]
    async fn test_logs_preserve_order() {
        let store = MemoryBuildStore::new();
        let id = Uuid::new_v4();
        store.append_log(id, "first", "system", "info").await.unwrap();
        store.append_log(id, "second", "planner", "warn").await.unwrap();

        let logs = store.logs(id).await;
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "first");
        assert_eq!(logs[1].message, "second");
        assert_eq!(logs[1].source, "planner");
    }

    #[tokio::test]
    async fn test_phase_costs_accumulate() {
        let store = MemoryBuildStore::new();
        let id = Uuid::new_v4();
        store
            .record_phase_cost(
                id,
                PhaseCost {
                    phase: "Phase 1".into(),
                    input_tokens: 1000,
                    output_tokens: 500,
                    model: "claude-opus-4-20250514".into(),
                    cost_usd: Decimal::new(525, 4),
                },
            )
            .await
            .unwrap();
        let costs = store.phase_costs(id).await;
        assert_eq!(costs.len(), 1);
        assert_eq!(costs[0].input_tokens, 1000);
    }
}
