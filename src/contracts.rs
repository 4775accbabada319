//! Governance contracts — project-scoped documents that constrain a build.
//!
//! Contracts are project-scoped, typed, versioned documents (blueprint,
//! manifesto, stack, schema, physics, boundaries, phases, ui). A build
//! captures a **pinned snapshot** of all contracts at start: the snapshot
//! is immutable for the build's lifetime and is the only contract surface
//! the Fixer role ever sees. Mutable contracts may change mid-build; other
//! roles pull the live versions through the `ContractStore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::BuildError;

/// The recognised contract document types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractType {
    Blueprint,
    Manifesto,
    Stack,
    Schema,
    Physics,
    Boundaries,
    Phases,
    Ui,
}

impl ContractType {
    pub const ALL: [ContractType; 8] = [
        ContractType::Blueprint,
        ContractType::Manifesto,
        ContractType::Stack,
        ContractType::Schema,
        ContractType::Physics,
        ContractType::Boundaries,
        ContractType::Phases,
        ContractType::Ui,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContractType::Blueprint => "blueprint",
            ContractType::Manifesto => "manifesto",
            ContractType::Stack => "stack",
            ContractType::Schema => "schema",
            ContractType::Physics => "physics",
            ContractType::Boundaries => "boundaries",
            ContractType::Phases => "phases",
            ContractType::Ui => "ui",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "blueprint" => Some(ContractType::Blueprint),
            "manifesto" => Some(ContractType::Manifesto),
            "stack" => Some(ContractType::Stack),
            "schema" => Some(ContractType::Schema),
            "physics" => Some(ContractType::Physics),
            "boundaries" => Some(ContractType::Boundaries),
            "phases" => Some(ContractType::Phases),
            "ui" => Some(ContractType::Ui),
            _ => None,
        }
    }

    /// File extension used when materialising into the workspace.
    fn file_extension(&self) -> &'static str {
        match self {
            ContractType::Boundaries | ContractType::Schema => "json",
            ContractType::Physics => "yaml",
            _ => "md",
        }
    }
}

impl fmt::Display for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One project-scoped contract document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub contract_type: ContractType,
    pub content: String,
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}

impl Contract {
    pub fn new(contract_type: ContractType, content: &str) -> Self {
        Self {
            contract_type,
            content: content.to_string(),
            version: 1,
            updated_at: Utc::now(),
        }
    }

    /// Strip a surrounding markdown code fence, if present. Contracts
    /// authored through the questionnaire sometimes arrive fenced.
    pub fn unfenced_content(&self) -> &str {
        let trimmed = self.content.trim();
        if let Some(rest) = trimmed.strip_prefix("```") {
            let body = match rest.find('\n') {
                Some(nl) => &rest[nl + 1..],
                None => rest,
            };
            return body.trim_end().strip_suffix("```").unwrap_or(body).trim_end();
        }
        trimmed
    }
}

/// The immutable set of contracts captured when a build starts.
///
/// Cloning is cheap (Arc); content never changes after capture.
#[derive(Debug, Clone)]
pub struct ContractSnapshot {
    inner: Arc<HashMap<ContractType, Contract>>,
    pub captured_at: DateTime<Utc>,
}

impl ContractSnapshot {
    pub fn capture(contracts: Vec<Contract>) -> Self {
        let map = contracts
            .into_iter()
            .map(|c| (c.contract_type, c))
            .collect();
        Self {
            inner: Arc::new(map),
            captured_at: Utc::now(),
        }
    }

    pub fn get(&self, contract_type: ContractType) -> Option<&Contract> {
        self.inner.get(&contract_type)
    }

    pub fn types(&self) -> Vec<ContractType> {
        let mut types: Vec<_> = self.inner.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contract> {
        self.inner.values()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Render all contracts as one markdown section for tool results.
    pub fn as_markdown(&self) -> String {
        let mut parts = Vec::new();
        for t in self.types() {
            if let Some(c) = self.inner.get(&t) {
                parts.push(format!("## Contract: {}\n{}\n", t, c.content));
            }
        }
        parts.join("\n")
    }
}

/// Project-scoped contract access — the engine's read surface onto
/// whatever system persists contracts.
#[async_trait]
pub trait ContractStore: Send + Sync {
    /// Fetch the current (live) contract of a type, if present.
    async fn get_contract(
        &self,
        project_id: Uuid,
        contract_type: ContractType,
    ) -> Result<Option<Contract>, BuildError>;

    /// List contract types present for a project.
    async fn list_types(&self, project_id: Uuid) -> Result<Vec<ContractType>, BuildError>;

    /// Fetch every contract for the project (used to capture snapshots).
    async fn all_contracts(&self, project_id: Uuid) -> Result<Vec<Contract>, BuildError>;
}

/// In-memory contract store for the CLI's local mode and tests.
#[derive(Default)]
pub struct MemoryContractStore {
    by_project: Mutex<HashMap<Uuid, HashMap<ContractType, Contract>>>,
}

impl MemoryContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, project_id: Uuid, contract: Contract) {
        let mut guard = self.by_project.lock().await;
        guard
            .entry(project_id)
            .or_default()
            .insert(contract.contract_type, contract);
    }
}

#[async_trait]
impl ContractStore for MemoryContractStore {
    async fn get_contract(
        &self,
        project_id: Uuid,
        contract_type: ContractType,
    ) -> Result<Option<Contract>, BuildError> {
        let guard = self.by_project.lock().await;
        Ok(guard
            .get(&project_id)
            .and_then(|m| m.get(&contract_type))
            .cloned())
    }

    async fn list_types(&self, project_id: Uuid) -> Result<Vec<ContractType>, BuildError> {
        let guard = self.by_project.lock().await;
        let mut types: Vec<_> = guard
            .get(&project_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        types.sort_by_key(|t: &ContractType| t.as_str());
        Ok(types)
    }

    async fn all_contracts(&self, project_id: Uuid) -> Result<Vec<Contract>, BuildError> {
        let guard = self.by_project.lock().await;
        Ok(guard
            .get(&project_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Materialise a snapshot under `Forge/Contracts/` in the workspace so
/// file tools can locate contracts deterministically. The directory is in
/// the listing skip-set, keeping it out of scope scans.
pub fn materialise_contracts(workspace_root: &Path, snapshot: &ContractSnapshot) -> std::io::Result<()> {
    let dir = workspace_root.join("Forge").join("Contracts");
    std::fs::create_dir_all(&dir)?;
    for contract in snapshot.iter() {
        let name = format!(
            "{}.{}",
            contract.contract_type,
            contract.contract_type.file_extension()
        );
        std::fs::write(dir.join(name), contract.unfenced_content())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_type_round_trip() {
        for t in ContractType::ALL {
            assert_eq!(ContractType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ContractType::parse("nonsense"), None);
    }

    #[test]
    fn test_unfenced_content_strips_fence() {
        let contract = Contract::new(
            ContractType::Boundaries,
            "```json\n{\"layers\": []}\n```",
        );
        assert_eq!(contract.unfenced_content(), "{\"layers\": []}");

        let plain = Contract::new(ContractType::Stack, "Python 3.12");
        assert_eq!(plain.unfenced_content(), "Python 3.12");
    }

    #[test]
    fn test_snapshot_is_immutable_view() {
        let snapshot = ContractSnapshot::capture(vec![
            Contract::new(ContractType::Stack, "original stack"),
        ]);
        let clone = snapshot.clone();
        assert_eq!(
            clone.get(ContractType::Stack).unwrap().content,
            "original stack"
        );
        assert!(clone.get(ContractType::Physics).is_none());
    }

    #[test]
    fn test_snapshot_markdown_orders_by_type() {
        let snapshot = ContractSnapshot::capture(vec![
            Contract::new(ContractType::Stack, "S"),
            Contract::new(ContractType::Blueprint, "B"),
        ]);
        let md = snapshot.as_markdown();
        let blueprint_at = md.find("Contract: blueprint").unwrap();
        let stack_at = md.find("Contract: stack").unwrap();
        assert!(blueprint_at < stack_at);
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryContractStore::new();
        let project = Uuid::new_v4();
        store
            .put(project, Contract::new(ContractType::Phases, "## Phase 1 — X"))
            .await;

        let fetched = store
            .get_contract(project, ContractType::Phases)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.content, "## Phase 1 — X");

        let types = store.list_types(project).await.unwrap();
        assert_eq!(types, vec![ContractType::Phases]);

        assert!(store
            .get_contract(Uuid::new_v4(), ContractType::Phases)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_materialise_writes_expected_names() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ContractSnapshot::capture(vec![
            Contract::new(ContractType::Boundaries, "{\"layers\":[]}"),
            Contract::new(ContractType::Physics, "paths:\n  /users:\n"),
            Contract::new(ContractType::Stack, "Python"),
        ]);
        materialise_contracts(dir.path(), &snapshot).unwrap();
        let base = dir.path().join("Forge").join("Contracts");
        assert!(base.join("boundaries.json").exists());
        assert!(base.join("physics.yaml").exists());
        assert!(base.join("stack.md").exists());
    }
}
