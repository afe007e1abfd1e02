//! File tools bound to a repository root.
//!
//! All paths are repo-relative; absolute paths and `..` escapes are
//! rejected. Writes are recorded in a shared [`WriteLog`] so the implementor
//! can cross-check the files an agent *claims* to have modified against the
//! files it actually touched, and file writes stay serialised through the
//! implementor node — no other node is ever handed these tools.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{optional_u64, required_str, Tool, ToolError};
use crate::state::resolve_in_repo;

/// Shared record of every path successfully written during a task.
#[derive(Clone, Default)]
pub struct WriteLog {
    inner: Arc<Mutex<Vec<String>>>,
}

impl WriteLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, path: &str) {
        self.inner.lock().push(path.to_string());
    }

    /// Paths written since the last `take`, in write order.
    #[must_use]
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.lock())
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.inner.lock().iter().any(|p| p == path)
    }
}

fn resolve(tool: &str, repo_root: &Path, relative: &str) -> Result<PathBuf, ToolError> {
    resolve_in_repo(repo_root, relative).ok_or_else(|| ToolError::OutsideRepo {
        tool: tool.to_string(),
        path: relative.to_string(),
    })
}

fn io_err(tool: &str, source: std::io::Error) -> ToolError {
    ToolError::Io {
        tool: tool.to_string(),
        source,
    }
}

/// Read a whole file.
pub struct ReadFile {
    repo_root: PathBuf,
}

impl ReadFile {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }
}

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Read the entire content of a repo-relative file"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })
    }
    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        let path = required_str(&args, "path", self.name())?;
        let full = resolve(self.name(), &self.repo_root, path)?;
        if !full.is_file() {
            return Err(ToolError::NotFound {
                tool: self.name().into(),
                path: path.into(),
            });
        }
        let content = fs::read_to_string(&full).map_err(|e| io_err(self.name(), e))?;
        Ok(json!({"path": path, "content": content}))
    }
}

/// Read a line range of a file.
pub struct ReadFileLines {
    repo_root: PathBuf,
}

impl ReadFileLines {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }
}

#[async_trait]
impl Tool for ReadFileLines {
    fn name(&self) -> &str {
        "read_file_lines"
    }
    fn description(&self) -> &str {
        "Read a 1-based inclusive line range of a repo-relative file"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "start_line": {"type": "integer", "minimum": 1},
                "end_line": {"type": "integer", "minimum": 1}
            },
            "required": ["path", "start_line", "end_line"]
        })
    }
    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        let path = required_str(&args, "path", self.name())?;
        let start = optional_u64(&args, "start_line").unwrap_or(1).max(1) as usize;
        let end = optional_u64(&args, "end_line").unwrap_or(u64::MAX) as usize;
        if end < start {
            return Err(ToolError::InvalidArgs {
                tool: self.name().into(),
                message: format!("end_line {end} before start_line {start}"),
            });
        }
        let full = resolve(self.name(), &self.repo_root, path)?;
        let content = fs::read_to_string(&full).map_err(|e| io_err(self.name(), e))?;
        let slice: Vec<&str> = content
            .lines()
            .skip(start - 1)
            .take(end - start + 1)
            .collect();
        Ok(json!({
            "path": path,
            "start_line": start,
            "content": slice.join("\n")
        }))
    }
}

/// Write (create or overwrite) a file.
pub struct WriteFile {
    repo_root: PathBuf,
    log: WriteLog,
}

impl WriteFile {
    pub fn new(repo_root: impl Into<PathBuf>, log: WriteLog) -> Self {
        Self {
            repo_root: repo_root.into(),
            log,
        }
    }
}

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }
    fn description(&self) -> &str {
        "Write complete file content, creating parent directories as needed"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        })
    }
    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        let path = required_str(&args, "path", self.name())?;
        let content = required_str(&args, "content", self.name())?;
        let full = resolve(self.name(), &self.repo_root, path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(self.name(), e))?;
        }
        fs::write(&full, content).map_err(|e| io_err(self.name(), e))?;
        self.log.record(path);
        Ok(json!({"path": path, "bytes_written": content.len()}))
    }
}

/// Create a new file; fails if it already exists.
pub struct CreateFile {
    repo_root: PathBuf,
    log: WriteLog,
}

impl CreateFile {
    pub fn new(repo_root: impl Into<PathBuf>, log: WriteLog) -> Self {
        Self {
            repo_root: repo_root.into(),
            log,
        }
    }
}

#[async_trait]
impl Tool for CreateFile {
    fn name(&self) -> &str {
        "create_file"
    }
    fn description(&self) -> &str {
        "Create a new file with the given content; fails if the file exists"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        })
    }
    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        let path = required_str(&args, "path", self.name())?;
        let content = required_str(&args, "content", self.name())?;
        let full = resolve(self.name(), &self.repo_root, path)?;
        if full.exists() {
            return Err(ToolError::Failed {
                tool: self.name().into(),
                message: format!("{path} already exists; use write_file or apply_edit"),
            });
        }
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(self.name(), e))?;
        }
        fs::write(&full, content).map_err(|e| io_err(self.name(), e))?;
        self.log.record(path);
        Ok(json!({"path": path, "bytes_written": content.len()}))
    }
}

/// Replace one exact occurrence of a string in a file.
pub struct ApplyEdit {
    repo_root: PathBuf,
    log: WriteLog,
}

impl ApplyEdit {
    pub fn new(repo_root: impl Into<PathBuf>, log: WriteLog) -> Self {
        Self {
            repo_root: repo_root.into(),
            log,
        }
    }
}

#[async_trait]
impl Tool for ApplyEdit {
    fn name(&self) -> &str {
        "apply_edit"
    }
    fn description(&self) -> &str {
        "Replace an exact text match in a file; the match must be unique"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "old_string": {"type": "string"},
                "new_string": {"type": "string"}
            },
            "required": ["path", "old_string", "new_string"]
        })
    }
    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        let path = required_str(&args, "path", self.name())?;
        let old = required_str(&args, "old_string", self.name())?;
        let new = required_str(&args, "new_string", self.name())?;
        let full = resolve(self.name(), &self.repo_root, path)?;
        let content = fs::read_to_string(&full).map_err(|e| io_err(self.name(), e))?;

        let matches = content.matches(old).count();
        if matches == 0 {
            return Err(ToolError::Failed {
                tool: self.name().into(),
                message: format!("old_string not found in {path}"),
            });
        }
        if matches > 1 {
            return Err(ToolError::Failed {
                tool: self.name().into(),
                message: format!(
                    "old_string matches {matches} times in {path}; include more context or use write_file"
                ),
            });
        }
        let updated = content.replacen(old, new, 1);
        fs::write(&full, updated).map_err(|e| io_err(self.name(), e))?;
        self.log.record(path);
        Ok(json!({"path": path, "replacements": 1}))
    }
}

/// List the entries of a directory.
pub struct ListDirectory {
    repo_root: PathBuf,
}

impl ListDirectory {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }
}

#[async_trait]
impl Tool for ListDirectory {
    fn name(&self) -> &str {
        "list_directory"
    }
    fn description(&self) -> &str {
        "List entries of a repo-relative directory (non-recursive)"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"path": {"type": "string", "default": "."}}
        })
    }
    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(".");
        let full = resolve(self.name(), &self.repo_root, path)?;
        let mut entries = Vec::new();
        let read = fs::read_dir(&full).map_err(|e| io_err(self.name(), e))?;
        for entry in read {
            let entry = entry.map_err(|e| io_err(self.name(), e))?;
            let kind = if entry.path().is_dir() { "dir" } else { "file" };
            entries.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "kind": kind
            }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        Ok(json!({"path": path, "entries": entries}))
    }
}

const WALK_SKIP_DIRS: &[&str] = &[".git", ".rag_index", "target", "node_modules"];
const WALK_MAX_RESULTS: usize = 200;

fn walk_files(root: &Path, visit: &mut dyn FnMut(&Path) -> bool) {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(read) = fs::read_dir(&dir) else {
            continue;
        };
        let mut children: Vec<PathBuf> = read.flatten().map(|e| e.path()).collect();
        children.sort();
        for child in children {
            let name = child
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if child.is_dir() {
                if !WALK_SKIP_DIRS.contains(&name.as_str()) && !name.starts_with('.') {
                    stack.push(child);
                }
            } else if !visit(&child) {
                return;
            }
        }
    }
}

/// Find files whose name contains a pattern.
pub struct FindFilesByName {
    repo_root: PathBuf,
}

impl FindFilesByName {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }
}

#[async_trait]
impl Tool for FindFilesByName {
    fn name(&self) -> &str {
        "find_files_by_name"
    }
    fn description(&self) -> &str {
        "Find files whose name contains the given substring (case-insensitive)"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"pattern": {"type": "string"}},
            "required": ["pattern"]
        })
    }
    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        let pattern = required_str(&args, "pattern", self.name())?.to_ascii_lowercase();
        let mut found = Vec::new();
        let root = self.repo_root.clone();
        walk_files(&root, &mut |path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            if name.contains(&pattern) {
                if let Ok(relative) = path.strip_prefix(&root) {
                    found.push(relative.to_string_lossy().into_owned());
                }
            }
            found.len() < WALK_MAX_RESULTS
        });
        Ok(json!({"pattern": pattern, "files": found}))
    }
}

/// Search file contents for a literal pattern.
pub struct SearchFiles {
    repo_root: PathBuf,
}

impl SearchFiles {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }
}

#[async_trait]
impl Tool for SearchFiles {
    fn name(&self) -> &str {
        "search_files"
    }
    fn description(&self) -> &str {
        "Search file contents for a literal string; returns path, line, text"
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"pattern": {"type": "string"}},
            "required": ["pattern"]
        })
    }
    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        let pattern = required_str(&args, "pattern", self.name())?.to_string();
        let mut hits = Vec::new();
        let root = self.repo_root.clone();
        walk_files(&root, &mut |path| {
            if let Ok(content) = fs::read_to_string(path) {
                for (line_no, line) in content.lines().enumerate() {
                    if line.contains(&pattern) {
                        if let Ok(relative) = path.strip_prefix(&root) {
                            hits.push(json!({
                                "path": relative.to_string_lossy(),
                                "line": line_no + 1,
                                "text": line.trim()
                            }));
                        }
                        if hits.len() >= WALK_MAX_RESULTS {
                            return false;
                        }
                    }
                }
            }
            true
        });
        Ok(json!({"pattern": pattern, "matches": hits}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.rs"), "fn main() {\n    hello();\n}\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn write_records_in_log_and_read_round_trips() {
        let repo = temp_repo();
        let log = WriteLog::new();
        let write = WriteFile::new(repo.path(), log.clone());
        let read = ReadFile::new(repo.path());

        write
            .call(json!({"path": "src/new.rs", "content": "pub fn f() {}\n"}))
            .await
            .unwrap();
        assert!(log.contains("src/new.rs"));

        let out = read.call(json!({"path": "src/new.rs"})).await.unwrap();
        assert_eq!(out["content"], "pub fn f() {}\n");
    }

    #[tokio::test]
    async fn apply_edit_requires_unique_match() {
        let repo = temp_repo();
        let log = WriteLog::new();
        fs::write(repo.path().join("dup.txt"), "x\nx\n").unwrap();
        let edit = ApplyEdit::new(repo.path(), log);

        let err = edit
            .call(json!({"path": "dup.txt", "old_string": "x", "new_string": "y"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
    }

    #[tokio::test]
    async fn create_refuses_existing() {
        let repo = temp_repo();
        let create = CreateFile::new(repo.path(), WriteLog::new());
        let err = create
            .call(json!({"path": "main.rs", "content": ""}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
    }

    #[tokio::test]
    async fn escape_paths_are_rejected() {
        let repo = temp_repo();
        let read = ReadFile::new(repo.path());
        let err = read
            .call(json!({"path": "../outside.txt"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::OutsideRepo { .. }));
    }

    #[tokio::test]
    async fn search_finds_line() {
        let repo = temp_repo();
        let search = SearchFiles::new(repo.path());
        let out = search.call(json!({"pattern": "hello"})).await.unwrap();
        let matches = out["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["line"], 2);
    }

    #[tokio::test]
    async fn read_lines_slices_inclusive_range() {
        let repo = temp_repo();
        let read = ReadFileLines::new(repo.path());
        let out = read
            .call(json!({"path": "main.rs", "start_line": 1, "end_line": 2}))
            .await
            .unwrap();
        assert_eq!(out["content"], "fn main() {\n    hello();");
    }
}
