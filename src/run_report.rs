use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::analyze::AnalysisResult;
use crate::mutant::{AppliedMutation, ApplicatorWarning, KillPolicy, MutantStatus, TestClass};
use crate::operators::{OperatorCategory, OperatorSets};
use crate::pytest::{SuiteSummary, TestCase, TestOutcome, TestReport};
use crate::select::{MutationPlan, Strategy, eligible_sites};

/// Result of running the unmutated suite.
#[derive(Debug, Clone, Serialize)]
pub struct BaselineReport {
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
    pub suites: Vec<SuiteSummary>,
    /// Cases that did not pass and therefore carry no signal.
    pub not_passing: Vec<TestCase>,
}

impl BaselineReport {
    pub fn from_report(report: &TestReport) -> Self {
        Self {
            exit_code: report.exit_code,
            duration_ms: report.duration.as_millis() as u64,
            passed: report.count(TestOutcome::Passed),
            failed: report.count(TestOutcome::Failed),
            errors: report.count(TestOutcome::Error),
            skipped: report.count(TestOutcome::Skipped),
            suites: report.suites(),
            not_passing: report.not_passing().cloned().collect(),
        }
    }

    pub fn all_passed(&self) -> bool {
        self.not_passing.is_empty()
    }
}

/// Operator sites found in one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInventory {
    pub file: PathBuf,
    pub sites: BTreeMap<OperatorCategory, usize>,
    /// Sites on covered lines.
    pub covered: usize,
    /// Covered sites that are complementable and approved.
    pub eligible: usize,
}

impl FileInventory {
    pub fn from_analysis(analysis: &AnalysisResult, operators: &OperatorSets) -> Self {
        Self {
            file: analysis.file.clone(),
            sites: analysis
                .sites
                .iter()
                .map(|(category, sites)| (*category, sites.len()))
                .collect(),
            covered: analysis
                .all_sites()
                .iter()
                .filter(|s| analysis.is_covered(s))
                .count(),
            eligible: eligible_sites(analysis, operators).len(),
        }
    }

    pub fn total(&self) -> usize {
        self.sites.values().sum()
    }
}

/// What happened to one file during one iteration.
#[derive(Debug, Clone, Serialize)]
pub struct FileMutation {
    pub plan: MutationPlan,
    pub mutations: Vec<AppliedMutation>,
    pub notes: Vec<ApplicatorWarning>,
    /// Line diff of the mutant against the original, empty when unchanged.
    pub diff: String,
}

/// Classification of one test case in one iteration.
#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub id: String,
    /// `None` when the case disappeared from the report under mutation.
    pub outcome: Option<TestOutcome>,
    pub class: TestClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassCounts {
    pub killed: usize,
    pub survived: usize,
    pub errored: usize,
    pub skipped: usize,
}

impl ClassCounts {
    pub fn tally<'a>(cases: impl IntoIterator<Item = &'a CaseResult>) -> Self {
        let mut counts = Self::default();
        for case in cases {
            match case.class {
                TestClass::Killed => counts.killed += 1,
                TestClass::Survived => counts.survived += 1,
                TestClass::Errored => counts.errored += 1,
                TestClass::Skipped => counts.skipped += 1,
            }
        }
        counts
    }
}

/// One mutate → test → restore cycle.
#[derive(Debug, Clone, Serialize)]
pub struct IterationResult {
    pub index: usize,
    pub files: Vec<FileMutation>,
    pub warnings: Vec<String>,
    pub cases: Vec<CaseResult>,
    pub counts: ClassCounts,
    pub status: MutantStatus,
    /// Why the mutant could not be materialized, if it could not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutant_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl IterationResult {
    pub fn mutation_count(&self) -> usize {
        self.files.iter().map(|f| f.mutations.len()).sum()
    }

    pub fn mutations(&self) -> impl Iterator<Item = (&FileMutation, &AppliedMutation)> {
        self.files
            .iter()
            .flat_map(|f| f.mutations.iter().map(move |m| (f, m)))
    }
}

/// Mutant-level totals across all iterations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub iterations: usize,
    pub killed: usize,
    pub survived: usize,
    pub errored: usize,
    pub unmutated: usize,
}

impl RunTotals {
    pub fn from_iterations(iterations: &[IterationResult]) -> Self {
        let mut totals = Self {
            iterations: iterations.len(),
            ..Self::default()
        };
        for it in iterations {
            match it.status {
                MutantStatus::Killed => totals.killed += 1,
                MutantStatus::Survived => totals.survived += 1,
                MutantStatus::Errored => totals.errored += 1,
                MutantStatus::Unmutated => totals.unmutated += 1,
            }
        }
        totals
    }

    /// Killed share of mutants that ran to a verdict, in percent.
    pub fn score(&self) -> Option<f64> {
        let decided = self.killed + self.survived;
        (decided > 0).then(|| self.killed as f64 * 100.0 / decided as f64)
    }
}

/// Machine-readable report for a mutation run.
///
/// In `--json` mode this is printed to stdout; it is always written to
/// `report.json` in the output dir.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub tool: &'static str,
    pub version: &'static str,
    pub target: PathBuf,
    pub tests: PathBuf,
    pub strategy: Strategy,
    pub mutations_per_mutant: usize,
    pub seed: u64,
    pub kill_policy: KillPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<BaselineReport>,
    pub inventory: Vec<FileInventory>,
    pub iterations: Vec<IterationResult>,
    pub totals: RunTotals,
    pub interrupted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    pub fn new(
        target: PathBuf,
        tests: PathBuf,
        strategy: Strategy,
        mutations_per_mutant: usize,
        seed: u64,
        kill_policy: KillPolicy,
    ) -> Self {
        Self {
            tool: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            target,
            tests,
            strategy,
            mutations_per_mutant,
            seed,
            kill_policy,
            baseline: None,
            inventory: Vec::new(),
            iterations: Vec::new(),
            totals: RunTotals::default(),
            interrupted: false,
            error: None,
        }
    }

    pub fn push(&mut self, iteration: IterationResult) {
        self.iterations.push(iteration);
        self.totals = RunTotals::from_iterations(&self.iterations);
    }
}
