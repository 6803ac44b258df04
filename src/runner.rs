use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;

use crate::analyze::{AnalysisResult, analyze_project};
use crate::apply::apply_plan;
use crate::backup::{Backup, RestoreGuard};
use crate::error::TestRunnerError;
use crate::mutant::{KillPolicy, MutantStatus, TestClass, line_diff};
use crate::operators::OperatorSets;
use crate::project::Project;
use crate::pytest::{PytestRunner, TestReport};
use crate::run_report::{
    BaselineReport, CaseResult, ClassCounts, FileInventory, FileMutation, IterationResult,
    RunReport,
};
use crate::select::{MutationRequest, Strategy, select};
use crate::source::SourceFile;
use crate::syntax::serialize;
use crate::ui::Ui;

/// Runs the test suite once against whatever is on disk.
pub trait TestRunner {
    fn run_tests(&mut self) -> Result<TestReport, TestRunnerError>;
}

impl TestRunner for PytestRunner {
    fn run_tests(&mut self) -> Result<TestReport, TestRunnerError> {
        self.run()
    }
}

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Initializing,
    IterationPending,
    Mutating,
    Executing,
    Classifying,
    Restoring,
    Done,
    Failed,
}

/// Settings for one mutation run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub tests: PathBuf,
    pub out_dir: PathBuf,
    pub strategy: Strategy,
    pub iterations: usize,
    /// Sites to mutate per file per iteration (K).
    pub mutations: usize,
    pub operators: OperatorSets,
    pub kill_policy: KillPolicy,
    pub keep_backup: bool,
    /// Print each rewritten file in full once it is on disk.
    pub print_mutants: bool,
    pub seed: u64,
}

/// Drives backup → baseline → analysis → (mutate → test → classify →
/// restore)* → final restore.
pub struct Orchestrator<'a, T: TestRunner> {
    config: &'a RunConfig,
    runner: T,
    ui: &'a mut Ui,
    interrupt: &'a AtomicBool,
    state: RunState,
    transitions: Vec<RunState>,
    report: Option<RunReport>,
}

impl<'a, T: TestRunner> Orchestrator<'a, T> {
    pub fn new(config: &'a RunConfig, runner: T, ui: &'a mut Ui, interrupt: &'a AtomicBool) -> Self {
        Self {
            config,
            runner,
            ui,
            interrupt,
            state: RunState::Idle,
            transitions: vec![RunState::Idle],
            report: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Every state entered so far, in order.
    #[cfg(test)]
    pub fn transitions(&self) -> &[RunState] {
        &self.transitions
    }

    /// Whatever was recorded before a failure.
    pub fn take_partial_report(&mut self) -> Option<RunReport> {
        self.report.take()
    }

    fn enter(&mut self, state: RunState) {
        if self.state != state {
            self.state = state;
            self.transitions.push(state);
        }
    }

    /// Run the whole mutation campaign. The target is restored before this
    /// returns, whether it succeeds or not.
    pub fn run(&mut self, project: &Project) -> Result<RunReport> {
        self.enter(RunState::Initializing);
        self.report = Some(RunReport::new(
            project.target.clone(),
            self.config.tests.clone(),
            self.config.strategy,
            self.config.mutations,
            self.config.seed,
            self.config.kill_policy,
        ));

        let guard = match Backup::create(&project.target, &self.config.out_dir, self.config.keep_backup)
        {
            Ok(backup) => RestoreGuard::new(backup),
            Err(e) => {
                self.enter(RunState::Failed);
                return Err(e.context("failed to back up the target"));
            }
        };

        let outcome = self.drive(project, &guard);

        self.enter(RunState::Restoring);
        let restored = guard
            .finish()
            .context("failed to restore the target from backup");

        match (outcome, restored) {
            (Ok(()), Ok(())) => {
                self.enter(RunState::Done);
                self.report
                    .take()
                    .context("run report missing after a successful run")
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => {
                self.fail(&e);
                Err(e)
            }
            (Err(e), Err(restore)) => {
                self.fail(&e);
                Err(e.context(format!("{restore:#}")))
            }
        }
    }

    fn fail(&mut self, e: &anyhow::Error) {
        self.enter(RunState::Failed);
        if let Some(report) = self.report.as_mut() {
            report.error = Some(format!("{e:#}"));
        }
    }

    fn report_mut(&mut self) -> Result<&mut RunReport> {
        self.report.as_mut().context("run report not initialized")
    }

    fn drive(&mut self, project: &Project, guard: &RestoreGuard) -> Result<()> {
        let baseline = self
            .runner
            .run_tests()
            .context("baseline test run failed")?;
        let summary = BaselineReport::from_report(&baseline);

        self.ui.line(format!(
            "baseline: {} passed, {} failed, {} errors, {} skipped in {}ms",
            summary.passed, summary.failed, summary.errors, summary.skipped, summary.duration_ms
        ));
        if !summary.all_passed() {
            self.ui.run_warning(format!(
                "{} test(s) did not pass on the unmutated code; they are ignored when classifying",
                summary.not_passing.len()
            ));
            for case in &summary.not_passing {
                self.ui.detail(format!("  {:?} {}", case.outcome, case.id));
            }
            if !baseline.stdout.is_empty() {
                self.ui.detail(format!("stdout from test runner:\n{}", baseline.stdout));
            }
            if !baseline.stderr.is_empty() {
                self.ui.detail(format!("stderr from test runner:\n{}", baseline.stderr));
            }
        }
        self.report_mut()?.baseline = Some(summary);

        // Running the suite may have left bytecode or caches behind.
        guard.restore()?;

        let analyses = analyze_project(project, self.ui)?;
        let inventory: Vec<FileInventory> = analyses
            .iter()
            .map(|a| FileInventory::from_analysis(a, &self.config.operators))
            .collect();
        for inv in &inventory {
            self.ui.detail(format!(
                "{}: {} site(s), {} covered, {} eligible",
                inv.file.display(),
                inv.total(),
                inv.covered,
                inv.eligible
            ));
        }
        self.report_mut()?.inventory = inventory;

        let mut rng = StdRng::seed_from_u64(self.config.seed);

        for index in 0..self.config.iterations {
            if self.interrupt.load(Ordering::SeqCst) {
                self.ui.run_warning("interrupted; stopping before the next iteration");
                self.report_mut()?.interrupted = true;
                break;
            }

            self.enter(RunState::IterationPending);
            let iteration = self.iteration(index, project, &analyses, &baseline, &mut rng, guard)?;
            self.ui.iteration_progress(&iteration);
            self.report_mut()?.push(iteration);
        }

        Ok(())
    }

    fn iteration(
        &mut self,
        index: usize,
        project: &Project,
        analyses: &[AnalysisResult],
        baseline: &TestReport,
        rng: &mut StdRng,
        guard: &RestoreGuard,
    ) -> Result<IterationResult> {
        self.enter(RunState::Mutating);

        let mut files = Vec::new();
        let mut warnings = Vec::new();
        let mut mutant_error = None;

        for analysis in analyses {
            let request = MutationRequest {
                strategy: self.config.strategy,
                count: self.config.mutations,
                target: analysis,
            };
            let plan = select(&request, &self.config.operators, rng);
            if let Some(w) = &plan.warning {
                self.ui.run_warning(w);
                warnings.push(w.to_string());
            }

            let mutant = apply_plan(analysis, &plan, &self.config.operators, rng);
            for note in &mutant.notes {
                self.ui.detail(format!("note: {}: {note}", analysis.file.display()));
                warnings.push(format!("{}: {note}", analysis.file.display()));
            }

            let mut diff = String::new();
            if !mutant.mutations.is_empty() && mutant_error.is_none() {
                match serialize(&mutant.tree) {
                    Ok(text) => {
                        diff = line_diff(&analysis.file.to_string_lossy(), &analysis.source, &text);
                        source_for(project, analysis).write(&text)?;
                        if self.config.print_mutants {
                            self.ui
                                .title(format!("[mutant {index}: {}]", mutant.file.display()));
                            self.ui.line(text.trim_end());
                        }
                    }
                    Err(e) => {
                        let msg = format!("{}: {e}", analysis.file.display());
                        self.ui.run_warning(format!("mutant not materialized: {msg}"));
                        mutant_error = Some(msg);
                    }
                }
            }

            for m in &mutant.mutations {
                self.ui
                    .detail(format!("iteration {index}: {} {m}", analysis.file.display()));
            }

            files.push(FileMutation {
                plan,
                mutations: mutant.mutations,
                notes: mutant.notes,
                diff,
            });
        }

        if mutant_error.is_some() {
            // Nothing of this mutant stays on disk once the target is restored.
            for file in &mut files {
                file.mutations.clear();
                file.diff.clear();
            }
        }

        let mut result = IterationResult {
            index,
            files,
            warnings,
            cases: Vec::new(),
            counts: ClassCounts::default(),
            status: MutantStatus::Unmutated,
            mutant_error,
            duration_ms: None,
        };

        if result.mutant_error.is_some() {
            guard.restore()?;
            result.status = self.config.kill_policy.status([], true);
            return Ok(result);
        }

        if result.mutation_count() == 0 {
            let msg = "no eligible site was mutated; tests not run".to_string();
            self.ui.run_warning(format!("iteration {index}: {msg}"));
            result.warnings.push(msg);
            return Ok(result);
        }

        self.enter(RunState::Executing);
        let start = Instant::now();
        let report = self.runner.run_tests()?;
        result.duration_ms = Some(start.elapsed().as_millis() as u64);

        self.enter(RunState::Classifying);
        result.cases = classify(self.config.kill_policy, baseline, &report);
        for case in &result.cases {
            self.ui
                .detail(format!("  {:<9} {}", case.class.label(), case.id));
        }
        result.counts = ClassCounts::tally(&result.cases);
        result.status = self
            .config
            .kill_policy
            .status(result.cases.iter().map(|c| c.class), false);

        guard.restore()?;
        Ok(result)
    }
}

fn source_for(project: &Project, analysis: &AnalysisResult) -> SourceFile {
    project
        .find_source(&analysis.file)
        .cloned()
        .unwrap_or_else(|| SourceFile::new(&project.root, analysis.path.clone(), BTreeSet::new()))
}

/// Classify every test case of `now` against the baseline. Cases that
/// passed in the baseline but vanished from the report count as errored.
pub fn classify(policy: KillPolicy, baseline: &TestReport, now: &TestReport) -> Vec<CaseResult> {
    let mut cases: Vec<CaseResult> = now
        .cases
        .iter()
        .map(|case| CaseResult {
            id: case.id.clone(),
            outcome: Some(case.outcome),
            class: policy.classify(baseline.outcome_of(&case.id), case.outcome),
            message: case.message.clone(),
        })
        .collect();

    let reported: BTreeSet<&str> = now.cases.iter().map(|c| c.id.as_str()).collect();
    cases.extend(
        baseline
            .cases
            .iter()
            .filter(|c| !reported.contains(c.id.as_str()))
            .map(|c| CaseResult {
                id: c.id.clone(),
                outcome: None,
                class: if c.outcome == crate::pytest::TestOutcome::Passed {
                    TestClass::Errored
                } else {
                    TestClass::Skipped
                },
                message: Some("missing from the test report under mutation".to_string()),
            }),
    );

    cases
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageJson;
    use crate::pytest::{TestCase, TestOutcome};
    use std::collections::VecDeque;
    use std::fs;
    use std::path::Path;

    /// Test runner that inspects the corpus on disk and answers from a script.
    struct FakeRunner<F: FnMut(usize) -> Result<TestReport, TestRunnerError>> {
        calls: usize,
        respond: F,
    }

    fn fake<F>(respond: F) -> FakeRunner<F>
    where
        F: FnMut(usize) -> Result<TestReport, TestRunnerError>,
    {
        FakeRunner { calls: 0, respond }
    }

    impl<F: FnMut(usize) -> Result<TestReport, TestRunnerError>> TestRunner for FakeRunner<F> {
        fn run_tests(&mut self) -> Result<TestReport, TestRunnerError> {
            let call = self.calls;
            self.calls += 1;
            (self.respond)(call)
        }
    }

    fn case(id: &str, outcome: TestOutcome) -> TestCase {
        TestCase {
            id: id.to_string(),
            outcome,
            message: None,
            duration_secs: 0.0,
        }
    }

    fn report(cases: &[(&str, TestOutcome)]) -> TestReport {
        TestReport::from_cases(cases.iter().map(|(id, o)| case(id, *o)).collect())
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        project: Project,
        config: RunConfig,
        before: Vec<(PathBuf, String)>,
    }

    fn fixture(files: &[(&str, &str)], mutations: usize, iterations: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("pkg");
        fs::create_dir_all(&target).unwrap();

        let mut entries = Vec::new();
        let mut before = Vec::new();
        for (name, text) in files {
            let path = target.join(name);
            fs::write(&path, text).unwrap();
            let lines = text.lines().count() as u32;
            entries.push((path.clone(), (1..=lines).collect::<Vec<_>>()));
            before.push((path, text.to_string()));
        }

        let coverage = CoverageJson::from_entries(entries);
        let project = Project::load(&target, &coverage).unwrap();

        let config = RunConfig {
            tests: PathBuf::from("tests"),
            out_dir: dir.path().join("out"),
            strategy: Strategy::Deterministic,
            iterations,
            mutations,
            operators: OperatorSets::default(),
            kill_policy: KillPolicy::default(),
            keep_backup: false,
            print_mutants: false,
            seed: 11,
        };

        Fixture {
            _dir: dir,
            project,
            config,
            before,
        }
    }

    fn assert_unchanged(f: &Fixture) {
        for (path, text) in &f.before {
            assert_eq!(&fs::read_to_string(path).unwrap(), text, "{path:?} changed");
        }
        let names: Vec<_> = fs::read_dir(&f.project.target)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), f.before.len(), "stray files left: {names:?}");
    }

    #[test]
    fn one_failing_test_kills_the_mutant() {
        let f = fixture(&[("calc.py", "def add(a, b):\n    return a + b\n")], 1, 1);
        let calc = f.project.target.join("calc.py");
        let seen = std::cell::RefCell::new(Vec::new());

        let runner = fake(|call| {
            seen.borrow_mut().push(fs::read_to_string(&calc).unwrap());
            let add = if call == 0 {
                TestOutcome::Passed
            } else {
                TestOutcome::Failed
            };
            Ok(report(&[
                ("t.py::a", TestOutcome::Passed),
                ("t.py::b", TestOutcome::Passed),
                ("t.py::c", TestOutcome::Passed),
                ("t.py::add", add),
            ]))
        });

        let mut ui = Ui::silent();
        let interrupt = AtomicBool::new(false);
        let mut orch = Orchestrator::new(&f.config, runner, &mut ui, &interrupt);
        let report = orch.run(&f.project).unwrap();

        let it = &report.iterations[0];
        assert_eq!(
            it.counts,
            ClassCounts {
                killed: 1,
                survived: 3,
                errored: 0,
                skipped: 0,
            }
        );
        assert_eq!(it.status, MutantStatus::Killed);
        assert_eq!(report.totals.killed, 1);
        assert!(it.files[0].diff.contains("+    return a - b"));

        assert_eq!(seen.borrow()[1], "def add(a, b):\n    return a - b\n");
        assert_unchanged(&f);

        assert_eq!(
            orch.transitions(),
            &[
                RunState::Idle,
                RunState::Initializing,
                RunState::IterationPending,
                RunState::Mutating,
                RunState::Executing,
                RunState::Classifying,
                RunState::Restoring,
                RunState::Done,
            ]
        );
    }

    #[test]
    fn too_few_sites_mutates_all_and_warns() {
        let f = fixture(&[("m.py", "x = a + b\ny = c < d\n")], 5, 1);

        let runner = fake(|_| Ok(report(&[("t.py::x", TestOutcome::Passed)])));

        let mut ui = Ui::silent();
        let interrupt = AtomicBool::new(false);
        let report = Orchestrator::new(&f.config, runner, &mut ui, &interrupt)
            .run(&f.project)
            .unwrap();

        let it = &report.iterations[0];
        assert_eq!(it.mutation_count(), 2);
        assert_eq!(it.files[0].plan.warning.as_ref().unwrap().eligible, 2);
        assert_eq!(it.warnings.len(), 1);
        assert_eq!(it.status, MutantStatus::Survived);
        assert_unchanged(&f);
    }

    #[test]
    fn runner_failure_mid_run_restores_before_error() {
        let f = fixture(&[("m.py", "x = a + b\n")], 1, 3);
        let path = f.project.target.join("m.py");
        let on_disk_at_failure = std::cell::RefCell::new(String::new());

        let runner = fake(|call| {
            if call < 2 {
                return Ok(report(&[("t.py::x", TestOutcome::Passed)]));
            }
            *on_disk_at_failure.borrow_mut() = fs::read_to_string(&path).unwrap();
            Err(TestRunnerError::MissingReport(PathBuf::from("r.json")))
        });

        let mut ui = Ui::silent();
        let interrupt = AtomicBool::new(false);
        let mut orch = Orchestrator::new(&f.config, runner, &mut ui, &interrupt);
        let err = orch.run(&f.project).unwrap_err();

        assert!(format!("{err:#}").contains("did not write a report"));
        assert_eq!(*on_disk_at_failure.borrow(), "x = a - b\n");
        assert_unchanged(&f);
        assert_eq!(orch.state(), RunState::Failed);
        assert!(orch.transitions().ends_with(&[RunState::Restoring, RunState::Failed]));

        let partial = orch.take_partial_report().unwrap();
        assert_eq!(partial.iterations.len(), 1);
        assert!(partial.error.is_some());
    }

    #[test]
    fn unserializable_mutant_is_errored_and_run_continues() {
        // A left-leaning chain deeper than the serializer walks.
        let terms = vec!["a"; 1100].join(" + ");
        let deep = format!("x = {terms}\n");
        let f = fixture(&[("deep.py", deep.as_str())], 1, 2);

        let calls = std::cell::Cell::new(0);
        let runner = fake(|_| {
            calls.set(calls.get() + 1);
            Ok(report(&[("t.py::x", TestOutcome::Passed)]))
        });

        let mut ui = Ui::silent();
        let interrupt = AtomicBool::new(false);
        let report = Orchestrator::new(&f.config, runner, &mut ui, &interrupt)
            .run(&f.project)
            .unwrap();

        assert_eq!(report.iterations.len(), 2);
        for it in &report.iterations {
            assert_eq!(it.status, MutantStatus::Errored);
            assert!(it.mutant_error.as_deref().unwrap().contains("nested deeper"));
            assert_eq!(it.mutation_count(), 0);
        }
        assert_eq!(calls.get(), 1, "only the baseline ran");
        assert_unchanged(&f);
    }

    #[test]
    fn unserializable_mutant_drops_mutations_of_every_file() {
        let terms = vec!["a"; 1100].join(" + ");
        let deep = format!("x = {terms}\n");
        let f = fixture(
            &[("calc.py", "y = b * c\n"), ("deep.py", deep.as_str())],
            1,
            1,
        );

        let runner = fake(|_| Ok(report(&[("t.py::x", TestOutcome::Passed)])));

        let mut ui = Ui::silent();
        let interrupt = AtomicBool::new(false);
        let report = Orchestrator::new(&f.config, runner, &mut ui, &interrupt)
            .run(&f.project)
            .unwrap();

        let it = &report.iterations[0];
        assert_eq!(it.status, MutantStatus::Errored);
        assert!(it.mutant_error.as_deref().unwrap().contains("deep.py"));
        assert_eq!(it.files.len(), 2);
        for file in &it.files {
            assert_eq!(file.plan.sites.len(), 1, "the plan is still recorded");
            assert!(file.mutations.is_empty(), "{:?}", file.plan.file);
            assert!(file.diff.is_empty(), "{:?}", file.plan.file);
        }
        assert_unchanged(&f);
    }

    #[test]
    fn interrupt_stops_between_iterations() {
        let f = fixture(&[("m.py", "x = a + b\n")], 1, 5);
        let interrupt = AtomicBool::new(false);

        let runner = fake(|call| {
            if call == 2 {
                interrupt.store(true, Ordering::SeqCst);
            }
            Ok(report(&[("t.py::x", TestOutcome::Passed)]))
        });

        let mut ui = Ui::silent();
        let report = Orchestrator::new(&f.config, runner, &mut ui, &interrupt)
            .run(&f.project)
            .unwrap();

        assert!(report.interrupted);
        assert_eq!(report.iterations.len(), 2);
        assert_unchanged(&f);
    }

    #[test]
    fn uncovered_file_runs_no_tests() {
        let f = fixture(&[("m.py", "x = a % b\n")], 1, 1);
        let mut queue = VecDeque::from([report(&[("t.py::x", TestOutcome::Passed)])]);

        let runner = fake(|_| Ok(queue.pop_front().expect("only the baseline should run")));

        let mut ui = Ui::silent();
        let interrupt = AtomicBool::new(false);
        let report = Orchestrator::new(&f.config, runner, &mut ui, &interrupt)
            .run(&f.project)
            .unwrap();

        assert_eq!(report.iterations[0].status, MutantStatus::Unmutated);
        assert_eq!(report.totals.unmutated, 1);
    }

    #[test]
    fn failing_baseline_tests_carry_no_signal() {
        let baseline = report(&[
            ("t.py::ok", TestOutcome::Passed),
            ("t.py::broken", TestOutcome::Failed),
            ("t.py::gone", TestOutcome::Passed),
        ]);
        let now = report(&[
            ("t.py::ok", TestOutcome::Error),
            ("t.py::broken", TestOutcome::Failed),
            ("t.py::new", TestOutcome::Failed),
        ]);

        let classes: Vec<(String, TestClass)> = classify(KillPolicy::default(), &baseline, &now)
            .into_iter()
            .map(|c| (c.id, c.class))
            .collect();

        assert_eq!(
            classes,
            vec![
                ("t.py::ok".to_string(), TestClass::Errored),
                ("t.py::broken".to_string(), TestClass::Skipped),
                ("t.py::new".to_string(), TestClass::Killed),
                ("t.py::gone".to_string(), TestClass::Errored),
            ]
        );
    }

    #[test]
    fn failing_baseline_test_warns_and_run_continues() {
        let f = fixture(&[("m.py", "x = a + b\n")], 1, 1);

        let runner = fake(|call| {
            let ok = if call == 0 {
                TestOutcome::Passed
            } else {
                TestOutcome::Failed
            };
            Ok(report(&[
                ("t.py::ok", ok),
                ("t.py::broken", TestOutcome::Failed),
            ]))
        });

        let mut ui = Ui::silent();
        let interrupt = AtomicBool::new(false);
        let mut orch = Orchestrator::new(&f.config, runner, &mut ui, &interrupt);
        let report = orch.run(&f.project).unwrap();
        assert_eq!(orch.state(), RunState::Done);

        let baseline = report.baseline.as_ref().unwrap();
        let not_passing: Vec<&str> = baseline.not_passing.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(not_passing, vec!["t.py::broken"]);

        let it = &report.iterations[0];
        assert_eq!(it.status, MutantStatus::Killed);
        assert_eq!(it.counts.killed, 1);
        assert_eq!(it.counts.skipped, 1);

        assert!(ui.warning_count() > 0);
        assert_unchanged(&f);
    }

    #[test]
    fn backup_location_is_removed_after_run() {
        let f = fixture(&[("m.py", "x = a + b\n")], 1, 1);
        let runner = fake(|_| Ok(report(&[("t.py::x", TestOutcome::Passed)])));

        let mut ui = Ui::silent();
        let interrupt = AtomicBool::new(false);
        Orchestrator::new(&f.config, runner, &mut ui, &interrupt)
            .run(&f.project)
            .unwrap();

        assert!(!Path::new(&f.config.out_dir).join("backup").exists());
    }
}
