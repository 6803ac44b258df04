use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;

use crate::error::AnalyzeError;
use crate::operators::{OperatorCategory, OperatorKind};
use crate::project::Project;
use crate::source::SourceFile;
use crate::syntax::{SyntaxTree, parse};
use crate::ui::Ui;

/// One operator occurrence that a mutant may rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct MutableSite {
    /// 1-based line of the operator token.
    pub line: u32,
    /// 0-based byte column of the operator token.
    pub column: u32,
    /// Index of the operator within a chained comparison or boolean chain.
    pub chain_index: usize,
    pub category: OperatorCategory,
    pub kind: OperatorKind,
}

/// Everything known about one covered file before mutation.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    /// Path relative to the project root.
    pub file: PathBuf,
    /// Absolute path on disk.
    pub path: PathBuf,
    /// Text the tree was parsed from.
    pub source: String,
    pub tree: SyntaxTree,
    pub covered_lines: BTreeSet<u32>,
    /// Sites per category, in traversal order.
    pub sites: BTreeMap<OperatorCategory, Vec<MutableSite>>,
}

impl AnalysisResult {
    /// All sites in traversal order, regardless of category.
    pub fn all_sites(&self) -> Vec<MutableSite> {
        let mut all: Vec<MutableSite> = self.sites.values().flatten().copied().collect();
        all.sort();
        all
    }

    pub fn site_count(&self) -> usize {
        self.sites.values().map(Vec::len).sum()
    }

    pub fn is_covered(&self, site: &MutableSite) -> bool {
        self.covered_lines.contains(&site.line)
    }
}

/// Parse `source` and record every operator in a mutable category.
pub fn analyze_source(
    file: &Path,
    path: &Path,
    source: String,
    covered_lines: BTreeSet<u32>,
) -> Result<AnalysisResult, AnalyzeError> {
    let tree = parse(&source).map_err(|source| AnalyzeError {
        file: file.to_path_buf(),
        source,
    })?;

    let mut sites: BTreeMap<OperatorCategory, Vec<MutableSite>> = BTreeMap::new();
    for op in tree.operators() {
        sites.entry(op.category).or_default().push(MutableSite {
            line: op.position.line,
            column: op.position.column,
            chain_index: op.chain_index,
            category: op.category,
            kind: op.kind,
        });
    }

    Ok(AnalysisResult {
        file: file.to_path_buf(),
        path: path.to_path_buf(),
        source,
        tree,
        covered_lines,
        sites,
    })
}

pub fn analyze_file(source: &SourceFile) -> Result<AnalysisResult> {
    let text = source.read_to_string()?;
    let result = analyze_source(
        source.relative_path(),
        source.path(),
        text,
        source.covered_lines.clone(),
    )?;
    Ok(result)
}

/// Analyze every covered file of the project. A file that does not parse
/// aborts the whole analysis.
pub fn analyze_project(project: &Project, ui: &Ui) -> Result<Vec<AnalysisResult>> {
    for missing in &project.missing {
        ui.warn(format!(
            "warning: {:?} was measured by coverage but no longer exists; skipping",
            missing
        ));
    }

    project
        .sources
        .iter()
        .map(|source| {
            let result = analyze_file(source)?;
            ui.detail(format!(
                "analyzed {}: {} operator site(s), {} covered line(s)",
                result.file.display(),
                result.site_count(),
                result.covered_lines.len()
            ));
            Ok(result)
        })
        .collect()
}
