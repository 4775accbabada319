//! Phase model — numbered units of work parsed from the phases contract.
//!
//! A phases contract is markdown with one `## Phase N — Name` heading per
//! phase, an `**Objective:**` line, and a `**Deliverables:**` bullet list.
//! The terminal phase is the last numbered entry.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// One numbered phase with its objective and ordered deliverables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub number: u32,
    pub name: String,
    pub objective: String,
    pub deliverables: Vec<String>,
}

impl Phase {
    pub fn new(number: u32, name: &str, objective: &str, deliverables: Vec<String>) -> Self {
        Self {
            number,
            name: name.to_string(),
            objective: objective.to_string(),
            deliverables,
        }
    }

    /// Label used in events and logs, e.g. "Phase 2 (Data Layer)".
    pub fn label(&self) -> String {
        format!("Phase {} ({})", self.number, self.name)
    }

    /// Deliverables rendered as the sub-agent message section.
    pub fn deliverables_text(&self) -> String {
        let mut out = format!(
            "Phase {} — {}\nObjective: {}\nDeliverables:\n",
            self.number, self.name, self.objective
        );
        for d in &self.deliverables {
            out.push_str(&format!("  - {d}\n"));
        }
        out
    }
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^## Phase\s+(\d+)\s*[-—–]+\s*(.+?)\s*$").unwrap())
}

fn objective_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\*\*Objective:\*\*\s*(.+?)(?:\n\n|\n\*\*|$)").unwrap())
}

fn deliverables_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*Deliverables:\*\*\s*\n((?:[-*]\s+.+\n?)+)").unwrap())
}

/// Parse a phases contract into ordered phase definitions.
///
/// Blocks without a recognisable header are skipped; the result keeps the
/// contract's own ordering (which is also numeric order in well-formed
/// contracts).
pub fn parse_phases_contract(content: &str) -> Vec<Phase> {
    let mut phases = Vec::new();

    // Split on headers, keeping each header with its block body.
    let mut block_starts: Vec<usize> = header_re().find_iter(content).map(|m| m.start()).collect();
    block_starts.push(content.len());

    for window in block_starts.windows(2) {
        let block = &content[window[0]..window[1]];
        let Some(header) = header_re().captures(block) else {
            continue;
        };
        let Ok(number) = header[1].parse::<u32>() else {
            continue;
        };
        let name = header[2].trim().to_string();

        let objective = objective_re()
            .captures(block)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_default();

        let mut deliverables = Vec::new();
        if let Some(caps) = deliverables_re().captures(block) {
            for line in caps[1].trim().lines() {
                let item = line.trim_start_matches(['-', '*']).trim();
                if !item.is_empty() {
                    deliverables.push(item.to_string());
                }
            }
        }

        phases.push(Phase {
            number,
            name,
            objective,
            deliverables,
        });
    }

    phases
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Build Phases

## Phase 1 — Foundation
**Objective:** Stand up the data layer.

**Deliverables:**
- app/models.py
- app/db.py

## Phase 2 — API Surface
**Objective:** Expose the REST endpoints.

**Deliverables:**
- app/api/routes.py
";

    #[test]
    fn test_parse_two_phases() {
        let phases = parse_phases_contract(SAMPLE);
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].number, 1);
        assert_eq!(phases[0].name, "Foundation");
        assert_eq!(phases[0].objective, "Stand up the data layer.");
        assert_eq!(phases[0].deliverables, vec!["app/models.py", "app/db.py"]);
        assert_eq!(phases[1].number, 2);
        assert_eq!(phases[1].deliverables, vec!["app/api/routes.py"]);
    }

    #[test]
    fn test_parse_em_dash_and_hyphen_headers() {
        let content = "## Phase 3 - Cleanup\n**Objective:** Tidy.\n";
        let phases = parse_phases_contract(content);
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].number, 3);
        assert_eq!(phases[0].name, "Cleanup");
    }

    #[test]
    fn test_parse_skips_malformed_blocks() {
        let content = "## Phase — no number\nstuff\n\n## Phase 5 — Real\n**Objective:** X.\n";
        let phases = parse_phases_contract(content);
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].number, 5);
    }

    #[test]
    fn test_parse_empty_content() {
        assert!(parse_phases_contract("").is_empty());
        assert!(parse_phases_contract("no phases here").is_empty());
    }

    #[test]
    fn test_deliverables_text_shape() {
        let phase = Phase::new(1, "Core", "Build it.", vec!["a.py".into()]);
        let text = phase.deliverables_text();
        assert!(text.contains("Phase 1 — Core"));
        assert!(text.contains("Objective: Build it."));
        assert!(text.contains("  - a.py"));
    }

    #[test]
    fn test_label() {
        let phase = Phase::new(4, "Hardening", "", vec![]);
        assert_eq!(phase.label(), "Phase 4 (Hardening)");
    }
}
