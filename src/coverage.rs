//! Line coverage consumed as a black box: which files were measured and which
//! of their lines executed.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Source of per-file covered line sets.
pub trait CoverageReader {
    /// Every file the coverage run measured (absolute paths).
    fn measured_files(&self) -> Vec<PathBuf>;

    /// 1-based lines of `file` that executed. Unknown files have none.
    fn covered_lines(&self, file: &Path) -> BTreeSet<u32>;
}

/// Coverage data loaded from the JSON written by `coverage json`.
#[derive(Debug, Clone, Default)]
pub struct CoverageJson {
    files: BTreeMap<PathBuf, BTreeSet<u32>>,
}

#[derive(Debug, Deserialize)]
struct RawReport {
    files: BTreeMap<String, RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(default)]
    executed_lines: Vec<u32>,
}

impl CoverageJson {
    /// Load a coverage.py JSON report. Relative paths in the report are
    /// resolved against the directory holding it.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));

        Self::from_json_str(&text, base).map_err(|message| ConfigError::File {
            path: path.to_path_buf(),
            message,
        })
    }

    fn from_json_str(text: &str, base: &Path) -> Result<Self, String> {
        let raw: RawReport =
            serde_json::from_str(text).map_err(|e| format!("not a coverage JSON report: {e}"))?;

        let files = raw
            .files
            .into_iter()
            .map(|(name, file)| {
                let path = normalize(&base.join(name));
                (path, file.executed_lines.into_iter().collect())
            })
            .collect();

        Ok(Self { files })
    }

    /// Build coverage data directly from `(file, lines)` pairs.
    #[cfg(test)]
    pub fn from_entries<I, L>(entries: I) -> Self
    where
        I: IntoIterator<Item = (PathBuf, L)>,
        L: IntoIterator<Item = u32>,
    {
        let files = entries
            .into_iter()
            .map(|(path, lines)| (normalize(&path), lines.into_iter().collect()))
            .collect();
        Self { files }
    }
}

impl CoverageReader for CoverageJson {
    fn measured_files(&self) -> Vec<PathBuf> {
        self.files.keys().cloned().collect()
    }

    fn covered_lines(&self, file: &Path) -> BTreeSet<u32> {
        self.files.get(&normalize(file)).cloned().unwrap_or_default()
    }
}

/// Absolute, canonical form when the file exists; otherwise the path as given.
pub fn normalize(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
