use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;

use crate::analyze::{AnalysisResult, analyze_project};
use crate::coverage::CoverageReader;
use crate::operators::{OperatorCategory, OperatorSets};
use crate::project::Project;
use crate::run_report::FileInventory;
use crate::ui::Ui;

/// Operator inventory of a target, without running any test.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectOverview {
    /// Canonical path of the target directory or file.
    pub target: PathBuf,

    /// Number of covered `.py` files that were analyzed.
    pub py_files: usize,

    /// Files listed by coverage that no longer exist on disk.
    pub missing_files: Vec<PathBuf>,

    /// Sites per category across all files.
    pub sites: BTreeMap<OperatorCategory, usize>,

    /// Sites on covered lines.
    pub covered_sites: usize,

    /// Covered sites that would be mutated under the given operator sets.
    pub eligible_sites: usize,

    pub files: Vec<FileInventory>,
}

impl ProjectOverview {
    pub fn from_analyses(
        project: &Project,
        analyses: &[AnalysisResult],
        operators: &OperatorSets,
    ) -> Self {
        let files: Vec<FileInventory> = analyses
            .iter()
            .map(|a| FileInventory::from_analysis(a, operators))
            .collect();

        let mut sites: BTreeMap<OperatorCategory, usize> =
            OperatorCategory::ALL.iter().map(|c| (*c, 0)).collect();
        for inv in &files {
            for (category, n) in &inv.sites {
                *sites.entry(*category).or_default() += n;
            }
        }

        ProjectOverview {
            target: project.target.clone(),
            py_files: files.len(),
            missing_files: project.missing.clone(),
            sites,
            covered_sites: files.iter().map(|f| f.covered).sum(),
            eligible_sites: files.iter().map(|f| f.eligible).sum(),
            files,
        }
    }

    pub fn total_sites(&self) -> usize {
        self.sites.values().sum()
    }
}

/// Extra per-file output of `scan`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inspect {
    /// Print the source text each tree was parsed from.
    pub source: bool,
    /// Print the outline of each syntax tree.
    pub tree: bool,
}

/// Load the target through its coverage data and inventory every file.
pub fn scan_project(
    target: &std::path::Path,
    coverage: &dyn CoverageReader,
    operators: &OperatorSets,
    inspect: Inspect,
    ui: &Ui,
) -> Result<ProjectOverview> {
    let project = Project::load(target, coverage)?;
    let analyses = analyze_project(&project, ui)?;

    for analysis in &analyses {
        if inspect.source {
            print_source(ui, analysis);
        }
        if inspect.tree {
            print_tree(ui, analysis);
        }
    }

    Ok(ProjectOverview::from_analyses(&project, &analyses, operators))
}

fn print_source(ui: &Ui, analysis: &AnalysisResult) {
    ui.title(format!("[from {}]", analysis.file.display()));
    ui.line(analysis.source.trim_end());
    ui.line("");
}

fn print_tree(ui: &Ui, analysis: &AnalysisResult) {
    ui.title(format!("[{} as a tree]", analysis.file.display()));
    ui.line(analysis.tree.outline().trim_end());
    ui.line("");
}
