//! Sandboxed workspace — all file I/O for a build happens under one root.
//!
//! Every tool input path is resolved against the root and rejected if it
//! is absolute, traverses upward, or escapes through a symlink. The
//! `.forge/` directory inside the workspace holds the per-build append-only
//! logs (handoffs, results, progress, manifest cache, scratchpad).

use fs2::FileExt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use crate::errors::ToolError;

/// Directory names hidden from listings and scans.
pub const SKIP_DIRS: [&str; 5] = [".git", "__pycache__", "node_modules", ".venv", "Forge"];

const FORGE_DIR: &str = ".forge";

/// A build's sandboxed file root. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open a workspace at an existing directory root.
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root: PathBuf = root.into();
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a project-relative path, rejecting escapes.
    ///
    /// Absolute paths and any `..` component are rejected up front; for
    /// paths whose parent already exists, the canonicalised parent must
    /// still sit under the root (symlink escape guard).
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, ToolError> {
        let candidate = Path::new(relative);
        if candidate.is_absolute() {
            return Err(ToolError::OutsideWorkspace);
        }
        for component in candidate.components() {
            match component {
                Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                    return Err(ToolError::OutsideWorkspace);
                }
                _ => {}
            }
        }

        let joined = self.root.join(candidate);

        // Walk up to the nearest existing ancestor and canonicalise it;
        // a symlink pointing outside the root fails here.
        let mut probe = joined.clone();
        while !probe.exists() {
            match probe.parent() {
                Some(parent) => probe = parent.to_path_buf(),
                None => return Err(ToolError::OutsideWorkspace),
            }
        }
        let canonical = probe.canonicalize()?;
        if !canonical.starts_with(&self.root) {
            return Err(ToolError::OutsideWorkspace);
        }

        Ok(joined)
    }

    /// Read a file's full contents.
    pub fn read(&self, relative: &str) -> Result<String, ToolError> {
        let path = self.resolve(relative)?;
        if !path.exists() {
            return Err(ToolError::FileNotFound(relative.to_string()));
        }
        if path.is_dir() {
            return Err(ToolError::IsDirectory(relative.to_string()));
        }
        Ok(std::fs::read_to_string(&path)?)
    }

    /// Write a file, creating parent directories.
    pub fn write(&self, relative: &str, content: &str) -> Result<(), ToolError> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.resolve(relative).map(|p| p.exists()).unwrap_or(false)
    }

    /// List one directory: (subdirectories, files), sorted, with the
    /// skip-set applied to directories.
    pub fn list(&self, relative: &str) -> Result<(Vec<String>, Vec<String>), ToolError> {
        let path = self.resolve(relative)?;
        if !path.exists() {
            return Err(ToolError::FileNotFound(relative.to_string()));
        }
        if !path.is_dir() {
            return Err(ToolError::NotADirectory(relative.to_string()));
        }
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() {
                if !SKIP_DIRS.contains(&name.as_str()) && name != FORGE_DIR {
                    dirs.push(name);
                }
            } else {
                files.push(name);
            }
        }
        dirs.sort();
        files.sort();
        Ok((dirs, files))
    }

    /// All source-ish files under the root as forward-slash relative
    /// paths, skip-set applied. Used by scope checks and snapshots.
    pub fn walk_files(&self) -> Vec<String> {
        let mut out = Vec::new();
        let walker = walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !(e.file_type().is_dir()
                    && (SKIP_DIRS.contains(&name.as_ref()) || name == FORGE_DIR))
            });
        for entry in walker.flatten() {
            if entry.file_type().is_file()
                && let Ok(rel) = entry.path().strip_prefix(&self.root)
            {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        out.sort();
        out
    }

    /// A compact markdown tree of the workspace for planner context.
    pub fn snapshot_markdown(&self) -> String {
        let files = self.walk_files();
        if files.is_empty() {
            return "(empty workspace)".to_string();
        }
        let mut out = String::new();
        for file in files {
            out.push_str("- ");
            out.push_str(&file);
            out.push('\n');
        }
        out
    }

    // -- .forge/ layout ----------------------------------------------------

    pub fn forge_dir(&self) -> PathBuf {
        self.root.join(FORGE_DIR)
    }

    /// Create the `.forge/` structure if missing.
    pub fn ensure_forge_dir(&self) -> std::io::Result<PathBuf> {
        let forge = self.forge_dir();
        std::fs::create_dir_all(forge.join("handoffs"))?;
        Ok(forge)
    }

    pub fn handoff_path(&self, handoff_id: &str) -> PathBuf {
        self.forge_dir().join("handoffs").join(format!("{handoff_id}.json"))
    }

    pub fn result_path(&self, handoff_id: &str) -> PathBuf {
        self.forge_dir()
            .join("handoffs")
            .join(format!("{handoff_id}_result.json"))
    }

    pub fn manifest_cache_path(&self, phase: u32) -> PathBuf {
        self.forge_dir().join(format!("manifest_phase_{phase}.json"))
    }

    pub fn progress_path(&self) -> PathBuf {
        self.forge_dir().join("progress.json")
    }

    pub fn scratchpad_path(&self) -> PathBuf {
        self.forge_dir().join("scratchpad.json")
    }

    /// Append a line to a `.forge/` log under a short exclusive file lock.
    pub fn append_forge_log(&self, name: &str, line: &str) -> std::io::Result<()> {
        self.ensure_forge_dir()?;
        let path = self.forge_dir().join(name);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.lock_exclusive()?;
        let result = writeln!(file, "{line}");
        let _ = fs2::FileExt::unlock(&file);
        result
    }
}
