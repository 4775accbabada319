//! Deterministic scout context — a zero-token digest of the workspace.
//!
//! Replaces a per-file Scout LLM call: a compact JSON with the top-level
//! exports seen in sibling files (`key_interfaces`), pattern directives
//! inferred from path conventions (`directives`), and who-imports-whom
//! (`imports_map`). Costs nothing and is fully reproducible.

use regex::Regex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::manifest::ManifestEntry;
use crate::workspace::Workspace;

/// Cap exports reported per file.
const MAX_EXPORTS_PER_FILE: usize = 20;

fn python_export_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(?:class|def|async def)\s+([A-Za-z_]\w*)|^([A-Z][A-Z0-9_]*)\s*=").unwrap()
    })
}

fn js_export_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^export\s+(?:default\s+)?(?:async\s+)?(?:function|class|const|let|interface|type)\s+([A-Za-z_$][\w$]*)")
            .unwrap()
    })
}

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^\s*(?:from\s+([\w.]+)\s+import|import\s+([\w.]+)|import\s+.*?from\s+['"]([^'"]+)['"])"#)
            .unwrap()
    })
}

/// Extract the top-level exported symbols from one source file.
pub fn extract_exports(path: &str, content: &str) -> Vec<String> {
    let mut exports = Vec::new();
    let is_js = [".ts", ".tsx", ".js", ".jsx"].iter().any(|e| path.ends_with(e));
    let re = if is_js { js_export_re() } else { python_export_re() };
    for caps in re.captures_iter(content) {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().to_string());
        if let Some(name) = name {
            if !exports.contains(&name) {
                exports.push(name);
            }
            if exports.len() >= MAX_EXPORTS_PER_FILE {
                break;
            }
        }
    }
    exports
}

/// Extract imported module names from one source file.
pub fn extract_imports(content: &str) -> Vec<String> {
    let mut imports = BTreeSet::new();
    for caps in import_re().captures_iter(content) {
        let module = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().to_string());
        if let Some(module) = module {
            if module.contains('/') || module.starts_with('.') {
                // JS path specifier — keep verbatim.
                imports.insert(module);
            } else {
                // Dotted python module — top-level name only.
                let top = module.split('.').next().unwrap_or(&module).to_string();
                imports.insert(top);
            }
        }
    }
    imports.into_iter().collect()
}

/// Directive inferred from one path's conventions, if any.
fn directive_for(path: &str) -> Option<(&'static str, &'static str)> {
    let lower = path.to_lowercase();
    if lower.contains("/routers/") || lower.contains("/routes/") {
        Some((
            "routers",
            "Handler files: one router per resource, thin handlers delegating to services.",
        ))
    } else if lower.contains("/services/") {
        Some((
            "services",
            "Service layer: business logic only, no direct HTTP or DB driver usage.",
        ))
    } else if lower.contains("/repos/") || lower.contains("/repositories/") {
        Some((
            "repos",
            "Repository layer: all persistence access goes through here.",
        ))
    } else if lower.contains("/models/") || lower.ends_with("models.py") {
        Some(("models", "Data models: schema definitions, no business logic."))
    } else if lower.contains("test") {
        Some((
            "tests",
            "Test files: mirror the module layout, one test file per module.",
        ))
    } else {
        None
    }
}

/// Build the scout context for one tier: a deterministic digest of what
/// already exists (prior tiers' files and the wider workspace) that the
/// coder needs to integrate with.
pub fn build_scout_context(
    workspace: &Workspace,
    tier_files: &[ManifestEntry],
    written_so_far: &BTreeMap<String, String>,
) -> Value {
    let mut key_interfaces: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut imports_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut directives: BTreeMap<String, String> = BTreeMap::new();

    // Already-written files in this build take precedence.
    for (path, content) in written_so_far {
        let exports = extract_exports(path, content);
        if !exports.is_empty() {
            key_interfaces.insert(path.clone(), exports);
        }
        let imports = extract_imports(content);
        if !imports.is_empty() {
            imports_map.insert(path.clone(), imports);
        }
    }

    // Then anything else on disk.
    for path in workspace.walk_files() {
        if key_interfaces.contains_key(&path) || written_so_far.contains_key(&path) {
            continue;
        }
        let source_ext = [".py", ".ts", ".tsx", ".js", ".jsx"]
            .iter()
            .any(|e| path.ends_with(e));
        if !source_ext {
            continue;
        }
        let Ok(content) = workspace.read(&path) else {
            continue;
        };
        let exports = extract_exports(&path, &content);
        if !exports.is_empty() {
            key_interfaces.insert(path.clone(), exports);
        }
        let imports = extract_imports(&content);
        if !imports.is_empty() {
            imports_map.insert(path.clone(), imports);
        }
    }

    // Directives from the tier's own paths.
    for entry in tier_files {
        if let Some((key, text)) = directive_for(&entry.path) {
            directives.insert(key.to_string(), text.to_string());
        }
    }

    json!({
        "key_interfaces": key_interfaces,
        "directives": directives,
        "imports_map": imports_map,
    })
}

/// Merge export maps (prior tiers + this tier + a candidate file) into
/// one symbol set for the integration check.
pub fn merged_symbols(maps: &[&BTreeMap<String, Vec<String>>]) -> BTreeSet<String> {
    let mut symbols = BTreeSet::new();
    for map in maps {
        for exports in map.values() {
            for export in exports {
                symbols.insert(export.clone());
            }
        }
    }
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileAction;

    #[test]
    fn test_extract_python_exports() {
        let content = "\
import os

MAX_SIZE = 10

class User:
    def method(self):
        pass

def get_user(user_id):
    pass

async def stream_users():
    pass

_private = 1
";
        let exports = extract_exports("app/models.py", content);
        assert_eq!(exports, vec!["MAX_SIZE", "User", "get_user", "stream_users"]);
    }

    #[test]
    fn test_extract_js_exports() {
        let content = "\
export function renderApp() {}
export default class Store {}
export const API_URL = 'x'
const internal = 1
";
        let exports = extract_exports("web/app.ts", content);
        assert_eq!(exports, vec!["renderApp", "Store", "API_URL"]);
    }

    #[test]
    fn test_extract_imports_python_and_js() {
        let py = "from app.db import session\nimport os\nimport app.models\n";
        assert_eq!(extract_imports(py), vec!["app", "os"]);

        let js = "import { thing } from './lib/thing'\n";
        assert!(extract_imports(js).contains(&"./lib/thing".to_string()));
    }

    #[test]
    fn test_scout_context_shape() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write("app/models.py", "class User: pass\n").unwrap();

        let mut written = BTreeMap::new();
        written.insert(
            "app/db.py".to_string(),
            "def get_session(): pass\n".to_string(),
        );

        let tier = vec![ManifestEntry::new(
            "app/routers/users.py",
            FileAction::Create,
            "user routes",
            60,
        )];
        let ctx = build_scout_context(&ws, &tier, &written);

        assert_eq!(ctx["key_interfaces"]["app/models.py"][0], "User");
        assert_eq!(ctx["key_interfaces"]["app/db.py"][0], "get_session");
        assert!(ctx["directives"]["routers"].as_str().unwrap().contains("router"));
    }

    #[test]
    fn test_scout_context_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path()).unwrap();
        ws.write("a.py", "def f(): pass\n").unwrap();
        ws.write("b.py", "def g(): pass\n").unwrap();

        let written = BTreeMap::new();
        let first = build_scout_context(&ws, &[], &written);
        let second = build_scout_context(&ws, &[], &written);
        assert_eq!(first, second);
    }

    #[test]
    fn test_merged_symbols() {
        let mut prior = BTreeMap::new();
        prior.insert("a.py".to_string(), vec!["A".to_string()]);
        let mut current = BTreeMap::new();
        current.insert("b.py".to_string(), vec!["B".to_string(), "A".to_string()]);

        let merged = merged_symbols(&[&prior, &current]);
        assert_eq!(merged.len(), 2);
        assert!(merged.contains("A"));
        assert!(merged.contains("B"));
    }
}
