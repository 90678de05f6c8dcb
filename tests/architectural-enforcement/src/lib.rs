//! Architectural Enforcement
//!
//! Source scanners shared by the integration tests in `tests/`. They enforce
//! two rules on the library code:
//! - No sleeping except for retry backoff and the teardown grace timer
//! - No blocking I/O inside async functions
//!
//! The scanners are line based. Everything from a file's `#[cfg(test)]`
//! module onward is test code and is not checked.

use std::fs;
use std::path::{Path, PathBuf};

/// Directories holding production code, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["taskroom/core/src", "taskroom/cli/src"];

/// Workspace root, resolved from this package's manifest
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// One production source file, with test code cut off
pub struct SourceFile {
    /// Path as found on disk
    pub path: PathBuf,
    /// Production lines
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Parse file content, keeping lines up to the test module
    #[must_use]
    pub fn from_content(path: PathBuf, content: &str) -> Self {
        let lines = content
            .lines()
            .take_while(|line| line.trim() != "#[cfg(test)]")
            .map(str::to_string)
            .collect();
        Self { path, lines }
    }

    /// Code part of line `idx`, without a trailing `//` comment
    #[must_use]
    pub fn code(&self, idx: usize) -> &str {
        let line = &self.lines[idx];
        line.split("//").next().unwrap_or(line)
    }

    /// Signature line of the function enclosing line `idx`
    #[must_use]
    pub fn enclosing_fn(&self, idx: usize) -> Option<&str> {
        self.lines[..=idx]
            .iter()
            .rev()
            .map(|line| line.trim())
            .find(|line| is_fn_signature(line))
    }

    /// Name of the function enclosing line `idx`
    #[must_use]
    pub fn enclosing_fn_name(&self, idx: usize) -> Option<&str> {
        let signature = self.enclosing_fn(idx)?;
        let after = signature.split("fn ").nth(1)?;
        let end = after
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        Some(&after[..end])
    }

    /// Whether line `idx` sits inside an `async fn`
    #[must_use]
    pub fn in_async_fn(&self, idx: usize) -> bool {
        self.enclosing_fn(idx)
            .is_some_and(|signature| signature.contains("async fn "))
    }

    /// Report a violation at line `idx`
    #[must_use]
    pub fn violation(&self, idx: usize, what: &str) -> String {
        format!(
            "{}:{} - {what}: {}",
            self.path.display(),
            idx + 1,
            self.lines[idx].trim()
        )
    }
}

fn is_fn_signature(line: &str) -> bool {
    let line = line
        .trim_start_matches("pub(crate) ")
        .trim_start_matches("pub ");
    line.starts_with("fn ") || line.starts_with("async fn ")
}

/// Load every production `.rs` file under the workspace
#[must_use]
pub fn production_files() -> Vec<SourceFile> {
    let root = workspace_root();
    PRODUCTION_DIRS
        .iter()
        .map(|dir| root.join(dir))
        .filter(|dir| dir.exists())
        .flat_map(|dir| {
            walkdir::WalkDir::new(dir)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("rs"))
                .collect::<Vec<_>>()
        })
        .filter_map(|entry| {
            let content = fs::read_to_string(entry.path()).ok()?;
            Some(SourceFile::from_content(entry.path().to_path_buf(), &content))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(code: &str) -> SourceFile {
        SourceFile::from_content(PathBuf::from("sample.rs"), code)
    }

    #[test]
    fn test_test_module_is_cut() {
        let src = file("fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() {}\n}\n");
        assert_eq!(src.lines.len(), 1);
    }

    #[test]
    fn test_enclosing_function() {
        let src = file(
            "impl X {\n    pub async fn recover(&self) {\n        tokio::time::sleep(d).await; // wait\n    }\n}\n",
        );
        assert_eq!(src.enclosing_fn_name(2), Some("recover"));
        assert!(src.in_async_fn(2));
        assert_eq!(src.code(2).trim(), "tokio::time::sleep(d).await;");
        assert_eq!(src.enclosing_fn_name(0), None);
    }

    #[test]
    fn test_sync_function_is_not_async() {
        let src = file("pub(crate) fn load() {\n    std::fs::read_to_string(p);\n}\n");
        assert!(!src.in_async_fn(1));
        assert_eq!(src.enclosing_fn_name(1), Some("load"));
    }

    #[test]
    fn test_production_sources_are_found() {
        assert!(production_files()
            .iter()
            .any(|f| f.path.ends_with("taskroom/core/src/lib.rs")));
    }
}
