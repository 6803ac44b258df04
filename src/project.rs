use std::fs;
use std::path::{Path, PathBuf};

use crate::coverage::CoverageReader;
use crate::error::ConfigError;
use crate::source::SourceFile;

/// Python target with the files the coverage run measured inside it.
#[derive(Debug, Clone)]
pub struct Project {
    /// Directory that relative paths are reported against. For a single-file
    /// target this is the file's parent.
    pub root: PathBuf,

    /// The target itself: a directory or one `.py` file (canonical).
    pub target: PathBuf,

    /// Measured `.py` files under the target, sorted by path.
    pub sources: Vec<SourceFile>,

    /// Measured files under the target that no longer exist on disk.
    pub missing: Vec<PathBuf>,
}

impl Project {
    /// Resolve `target` and pick up every measured Python file inside it.
    pub fn load(target: &Path, coverage: &dyn CoverageReader) -> Result<Self, ConfigError> {
        let target = validate_target(target)?;

        let root = if target.is_dir() {
            target.clone()
        } else {
            target
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| target.clone())
        };

        let mut sources = Vec::new();
        let mut missing = Vec::new();

        for file in coverage.measured_files() {
            if !file.starts_with(&target) || !is_python(&file) {
                continue;
            }
            if !file.is_file() {
                missing.push(file);
                continue;
            }

            let covered = coverage.covered_lines(&file);
            sources.push(SourceFile::new(&root, file, covered));
        }

        sources.sort_by(|a, b| a.root_relative.cmp(&b.root_relative));
        missing.sort();

        Ok(Self {
            root,
            target,
            sources,
            missing,
        })
    }

    pub fn find_source(&self, rel: &Path) -> Option<&SourceFile> {
        self.sources.iter().find(|s| s.relative_path() == rel)
    }
}

/// A target must exist; a file target must be Python source.
pub fn validate_target(target: &Path) -> Result<PathBuf, ConfigError> {
    let canonical =
        fs::canonicalize(target).map_err(|_| ConfigError::MissingPath(target.to_path_buf()))?;

    if canonical.is_file() && !is_python(&canonical) {
        return Err(ConfigError::NotPython(target.to_path_buf()));
    }

    Ok(canonical)
}

pub fn is_python(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "py")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::{CoverageJson, normalize};

    #[test]
    fn keeps_only_measured_python_files_under_target() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("pkg");
        fs::create_dir(&pkg).unwrap();
        fs::write(pkg.join("a.py"), "x = 1\n").unwrap();
        fs::write(pkg.join("b.py"), "y = 2\n").unwrap();
        fs::write(dir.path().join("outside.py"), "z = 3\n").unwrap();

        let coverage = CoverageJson::from_entries([
            (pkg.join("b.py"), vec![1]),
            (pkg.join("a.py"), vec![1]),
            (pkg.join("gone.py"), vec![1]),
            (dir.path().join("outside.py"), vec![1]),
        ]);

        let project = Project::load(&pkg, &coverage).unwrap();
        let rels: Vec<&Path> = project.sources.iter().map(|s| s.relative_path()).collect();

        assert_eq!(rels, vec![Path::new("a.py"), Path::new("b.py")]);
        assert_eq!(project.missing, vec![normalize(&pkg.join("gone.py"))]);
        assert!(project.find_source(Path::new("b.py")).is_some());
    }

    #[test]
    fn single_file_target_is_relative_to_its_parent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("calc.py");
        fs::write(&file, "x = 1\n").unwrap();

        let coverage = CoverageJson::from_entries([(file.clone(), vec![1])]);
        let project = Project::load(&file, &coverage).unwrap();

        assert_eq!(project.sources.len(), 1);
        assert_eq!(project.sources[0].relative_path(), Path::new("calc.py"));
    }

    #[test]
    fn rejects_missing_and_non_python_targets() {
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("notes.txt");
        fs::write(&txt, "hi").unwrap();

        assert!(matches!(
            validate_target(&txt),
            Err(ConfigError::NotPython(_))
        ));
        assert!(matches!(
            validate_target(&dir.path().join("nope")),
            Err(ConfigError::MissingPath(_))
        ));
    }
}
