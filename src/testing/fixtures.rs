//! Test fixtures for creating reproducible project directories.

use crate::config::{SETTINGS_DIR, SETTINGS_FILE};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary project directory.
///
/// Automatically cleans up when dropped.
pub struct TestFixture {
    temp_dir: TempDir,
}

impl TestFixture {
    /// Create an empty project.
    ///
    /// # Panics
    ///
    /// Panics if temporary directory creation fails.
    #[must_use]
    pub fn empty_project() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Create a project with `.flowguard/settings.json`.
    ///
    /// # Panics
    ///
    /// Panics if file creation fails.
    #[must_use]
    pub fn with_settings(json: &str) -> Self {
        let fixture = Self::empty_project();
        let dir = fixture.path().join(SETTINGS_DIR);
        std::fs::create_dir_all(&dir).expect("Failed to create settings dir");
        std::fs::write(dir.join(SETTINGS_FILE), json).expect("Failed to write settings");
        fixture
    }

    /// Write a file relative to the project root and return its path.
    ///
    /// # Panics
    ///
    /// Panics if the write fails.
    pub fn write_file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path().join(name);
        std::fs::write(&path, contents).expect("Failed to write fixture file");
        path
    }

    /// Project root.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A small scenario: original content, one draft revision from review.
    #[must_use]
    pub fn sample_scenario() -> &'static str {
        r#"{
  "request": { "topic": "ownership in practice", "origin": "original" },
  "stages": {
    "Draft": { "script": [{ "outcome": "fail", "message": "rate limited" }, { "outcome": "pass" }] }
  },
  "review": { "decisions": ["major", "approve"] }
}"#
    }
}
