use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Covered Python source file within the target.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the project root (for example `pkg/calc.py`).
    pub root_relative: PathBuf,

    /// Absolute path on disk.
    pub absolute_path: PathBuf,

    /// 1-based lines the coverage run saw executing.
    pub covered_lines: BTreeSet<u32>,
}

impl SourceFile {
    pub fn new(root: &Path, absolute_path: PathBuf, covered_lines: BTreeSet<u32>) -> Self {
        let root_relative = absolute_path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| absolute_path.clone());

        Self {
            root_relative,
            absolute_path,
            covered_lines,
        }
    }

    pub fn path(&self) -> &Path {
        &self.absolute_path
    }

    pub fn relative_path(&self) -> &Path {
        &self.root_relative
    }

    /// Load the full file contents as UTF-8 text.
    pub fn read_to_string(&self) -> Result<String> {
        fs::read_to_string(&self.absolute_path)
            .with_context(|| format!("failed to read source file {:?}", self.absolute_path))
    }

    /// Overwrite the file on disk.
    pub fn write(&self, contents: &str) -> Result<()> {
        fs::write(&self.absolute_path, contents)
            .with_context(|| format!("failed to write source file {:?}", self.absolute_path))
    }
}
