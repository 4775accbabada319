//! File-surface tools — read, list, search, write, edit, syntax, command.
//!
//! Every executor takes the tool's JSON input and the sandboxed workspace
//! and returns the tool-result string handed back to the model.

use regex::Regex;
use serde_json::{Value, json};
use std::time::Duration;

use crate::errors::ToolError;
use crate::workspace::Workspace;

/// Read results are truncated past this many characters.
const MAX_READ_CHARS: usize = 8_000;

/// search_code caps its hit list.
const MAX_SEARCH_HITS: usize = 100;

/// run_command default / ceiling timeouts.
const DEFAULT_CMD_TIMEOUT: u64 = 60;
const MAX_CMD_TIMEOUT: u64 = 300;

/// Commands refused outright. Screened at dispatch, not left to the model.
const DENIED_COMMAND_PATTERNS: [&str; 8] = [
    "rm -rf /",
    "sudo ",
    "shutdown",
    "reboot",
    "mkfs",
    "dd if=",
    "> /dev/",
    ":(){",
];

fn require_str<'a>(input: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidInput(format!("missing '{key}'")))
}

pub fn read_file(input: &Value, workspace: &Workspace) -> Result<String, ToolError> {
    let path = require_str(input, "path")?;
    let content = workspace.read(path)?;
    let total = content.len();
    let truncated = total > MAX_READ_CHARS;
    let body: &str = if truncated {
        let mut end = MAX_READ_CHARS;
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        &content[..end]
    } else {
        &content
    };
    Ok(json!({
        "content": body,
        "size_chars": total,
        "truncated": truncated,
    })
    .to_string())
}

pub fn list_directory(input: &Value, workspace: &Workspace) -> Result<String, ToolError> {
    let path = input.get("path").and_then(|v| v.as_str()).unwrap_or(".");
    let (directories, files) = workspace.list(path)?;
    Ok(json!({
        "path": path,
        "directories": directories,
        "files": files,
    })
    .to_string())
}

pub fn search_code(input: &Value, workspace: &Workspace) -> Result<String, ToolError> {
    let pattern = require_str(input, "pattern")?;
    let scope = input.get("path").and_then(|v| v.as_str()).unwrap_or("");
    let re = Regex::new(pattern).map_err(|e| ToolError::InvalidInput(format!("bad regex: {e}")))?;

    let mut hits = Vec::new();
    'outer: for rel in workspace.walk_files() {
        if !scope.is_empty() && !rel.starts_with(scope) {
            continue;
        }
        let Ok(content) = workspace.read(&rel) else {
            continue;
        };
        for (lineno, line) in content.lines().enumerate() {
            if re.is_match(line) {
                hits.push(format!("{rel}:{}:{}", lineno + 1, line.trim()));
                if hits.len() >= MAX_SEARCH_HITS {
                    break 'outer;
                }
            }
        }
    }

    Ok(json!({
        "pattern": pattern,
        "matches": hits,
        "match_count": hits.len(),
        "capped": hits.len() >= MAX_SEARCH_HITS,
    })
    .to_string())
}

pub fn write_file(input: &Value, workspace: &Workspace) -> Result<String, ToolError> {
    let path = require_str(input, "path")?;
    let content = require_str(input, "content")?;
    workspace.write(path, content)?;
    Ok(json!({
        "path": path,
        "bytes_written": content.len(),
    })
    .to_string())
}

/// Structured patch: old_text must occur exactly once.
pub fn edit_file(input: &Value, workspace: &Workspace) -> Result<String, ToolError> {
    let path = require_str(input, "path")?;
    let old_text = require_str(input, "old_text")?;
    let new_text = require_str(input, "new_text")?;
    if old_text.is_empty() {
        return Err(ToolError::EditFailed("old_text is empty".into()));
    }

    let content = workspace.read(path)?;
    let occurrences = content.matches(old_text).count();
    if occurrences == 0 {
        return Err(ToolError::EditFailed(format!(
            "old_text not found in {path}"
        )));
    }
    if occurrences > 1 {
        return Err(ToolError::EditFailed(format!(
            "old_text occurs {occurrences} times in {path}; make it unique"
        )));
    }

    let updated = content.replacen(old_text, new_text, 1);
    workspace.write(path, &updated)?;
    Ok(json!({
        "path": path,
        "replaced": true,
    })
    .to_string())
}

/// Language-aware structural check. Data formats get a real parse; code
/// files get a bracket/fence balance scan. Kept deterministic — no
/// external toolchain is invoked.
pub fn check_syntax(input: &Value, workspace: &Workspace) -> Result<String, ToolError> {
    let path = require_str(input, "path")?;
    let content = workspace.read(path)?;
    let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();

    let (language, errors) = match ext.as_str() {
        "json" => (
            "json",
            serde_json::from_str::<Value>(&content)
                .err()
                .map(|e| vec![e.to_string()])
                .unwrap_or_default(),
        ),
        "yaml" | "yml" => (
            "yaml",
            serde_yaml::from_str::<serde_yaml::Value>(&content)
                .err()
                .map(|e| vec![e.to_string()])
                .unwrap_or_default(),
        ),
        "toml" => (
            "toml",
            toml::from_str::<toml::Value>(&content)
                .err()
                .map(|e| vec![e.to_string()])
                .unwrap_or_default(),
        ),
        "py" => ("python", balance_errors(&content)),
        "js" | "jsx" | "ts" | "tsx" => ("javascript", balance_errors(&content)),
        _ => ("plaintext", Vec::new()),
    };

    Ok(json!({
        "path": path,
        "language": language,
        "valid": errors.is_empty(),
        "errors": errors,
    })
    .to_string())
}

/// Bracket/quote balance scan for code files, string-literal aware enough
/// to avoid the obvious false positives.
fn balance_errors(content: &str) -> Vec<String> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut errors = Vec::new();

    for (lineno, line) in content.lines().enumerate() {
        let mut in_string: Option<char> = None;
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            if let Some(quote) = in_string {
                if c == '\\' {
                    chars.next();
                } else if c == quote {
                    in_string = None;
                }
                continue;
            }
            match c {
                '#' => break, // comment to end of line (py-style)
                '/' if chars.peek() == Some(&'/') => break,
                '\'' | '"' | '`' => in_string = Some(c),
                '(' | '[' | '{' => stack.push((c, lineno + 1)),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, open_line)) => errors.push(format!(
                            "line {}: '{c}' does not match '{open}' opened at line {open_line}",
                            lineno + 1
                        )),
                        None => errors.push(format!("line {}: unmatched '{c}'", lineno + 1)),
                    }
                }
                _ => {}
            }
        }
    }

    for (open, line) in stack {
        errors.push(format!("line {line}: '{open}' never closed"));
    }
    errors
}

pub async fn run_command(input: &Value, workspace: &Workspace) -> Result<String, ToolError> {
    let command = require_str(input, "command")?;
    for denied in DENIED_COMMAND_PATTERNS {
        if command.contains(denied) {
            return Err(ToolError::CommandDenied(format!(
                "contains forbidden pattern '{denied}'"
            )));
        }
    }

    let timeout_secs = input
        .get("timeout_seconds")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_CMD_TIMEOUT)
        .min(MAX_CMD_TIMEOUT);

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workspace.root())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output())
        .await
        .map_err(|_| ToolError::CommandTimeout(timeout_secs))??;

    Ok(json!({
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
        "exit_code": output.status.code().unwrap_or(-1),
    })
    .to_string())
}
