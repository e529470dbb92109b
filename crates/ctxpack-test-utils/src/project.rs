//! Temporary project trees.
//!
//! [`TestProject`] owns a temp directory that is deleted when the value is
//! dropped, guaranteeing cleanup even on panic.

use std::path::{Path, PathBuf};

use ctxpack_config::AppConfig;
use ctxpack_core::Collector;
use tempfile::TempDir;

/// A scratch project root populated file by file.
///
/// # Example
///
/// ```ignore
/// let project = TestProject::new()
///     .file("README.md", "# demo\n")
///     .file("src/main.py", "def auth(): ...\n");
/// let collector = project.collector(&TestConfigBuilder::new().build());
/// ```
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    /// Write `content` to `relative`, creating parent directories.
    pub fn file(self, relative: &str, content: impl AsRef<[u8]>) -> Self {
        self.write(relative, content);
        self
    }

    /// Write a file of `len` bytes of repeated `byte`.
    pub fn sized_file(self, relative: &str, len: usize, byte: u8) -> Self {
        self.write(relative, vec![byte; len]);
        self
    }

    /// Write or overwrite a file on an existing project.
    pub fn write(&self, relative: &str, content: impl AsRef<[u8]>) {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent dirs");
        }
        std::fs::write(&path, content).expect("failed to write test file");
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// A collector over this project.
    pub fn collector(&self, config: &AppConfig) -> Collector {
        Collector::new(self.root(), config).expect("failed to build collector")
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}
