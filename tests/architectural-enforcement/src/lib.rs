//! Architectural Enforcement Integration Tests
//!
//! Source scans that keep the delivery core honest:
//! - Monotonic time and timers only through the `Clock` abstraction
//! - No blocking I/O inside async functions
//!
//! The scanning helpers live here so each test file stays a list of rules.

use std::fs;
use std::path::{Path, PathBuf};

/// Workspace-relative path of a source tree
#[must_use]
pub fn workspace_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join(relative)
}

/// A production source file, with its `#[cfg(test)]` tail removed
pub struct SourceFile {
    /// Path on disk
    pub path: PathBuf,
    /// Lines up to the first `#[cfg(test)]` marker
    pub lines: Vec<String>,
}

/// Load every `.rs` file under `dir`
///
/// Returns an empty list when the directory is missing so a renamed tree
/// shows up as a failing "no files scanned" assertion rather than a panic.
#[must_use]
pub fn production_sources(dir: &Path) -> Vec<SourceFile> {
    let mut files = Vec::new();
    if !dir.exists() {
        return files;
    }

    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
    {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
            continue;
        }
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };
        files.push(SourceFile {
            path: entry.path().to_path_buf(),
            lines: strip_test_module(&content),
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

/// Drop everything from the first `#[cfg(test)]` line onwards
#[must_use]
pub fn strip_test_module(content: &str) -> Vec<String> {
    content
        .lines()
        .take_while(|line| line.trim() != "#[cfg(test)]")
        .map(str::to_string)
        .collect()
}

/// Code part of a line, without a trailing `//` comment
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Whether the line at `current_idx` sits inside an `async fn`
#[must_use]
pub fn is_in_async_function(lines: &[String], current_idx: usize) -> bool {
    for line in lines[..current_idx].iter().rev() {
        let line = line.trim();

        if line.contains("async fn ") {
            return true;
        }
        if (line.starts_with("fn ") || line.contains(" fn ")) && !line.contains("async") {
            return false;
        }
        if line.starts_with("mod ") || (line.starts_with("impl") && line.contains('{')) {
            return false;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_strip_test_module() {
        let lines = strip_test_module("fn a() {}\n#[cfg(test)]\nmod tests {}\n");
        assert_eq!(lines, vec!["fn a() {}".to_string()]);
    }

    #[test]
    fn test_async_detection() {
        let code = owned(&[
            "    pub async fn load(&self) {",
            "        let s = std::fs::read_to_string(\"x\");",
            "    }",
        ]);
        assert!(is_in_async_function(&code, 1));

        let code = owned(&["fn load() {", "    let s = std::fs::read_to_string(\"x\");", "}"]);
        assert!(!is_in_async_function(&code, 1));
    }

    #[test]
    fn test_code_part_drops_comments() {
        assert_eq!(code_part("let a = 1; // Instant::now()"), "let a = 1; ");
    }
}
