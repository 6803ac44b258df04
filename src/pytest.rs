//! Test-runner subprocess and the pytest-json-report reader.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::TestRunnerError;

pub const DEFAULT_COMMAND: &str = "python3 -m pytest {tests} -q -p no:cacheprovider --json-report --json-report-file={report}";

/// Environment variable carrying the report path to the child.
pub const REPORT_ENV: &str = "PY_MUTANT_REPORT";

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Outcome of one test case as the runner reported it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Error,
    Skipped,
}

impl TestOutcome {
    /// Map a pytest outcome string. Expected failures count as skipped,
    /// unexpected passes as passed.
    pub fn from_pytest(outcome: &str) -> Option<Self> {
        match outcome {
            "passed" | "xpassed" => Some(TestOutcome::Passed),
            "failed" => Some(TestOutcome::Failed),
            "error" => Some(TestOutcome::Error),
            "skipped" | "xfailed" => Some(TestOutcome::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestCase {
    /// pytest node id (`tests/test_calc.py::test_add`).
    pub id: String,
    pub outcome: TestOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub duration_secs: f64,
}

impl TestCase {
    /// File part of the node id.
    pub fn suite(&self) -> &str {
        self.id.split("::").next().unwrap_or(&self.id)
    }
}

/// Per-file counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SuiteSummary {
    pub name: String,
    pub total: usize,
    pub failures: usize,
    pub errors: usize,
    pub skipped: usize,
    pub duration_secs: f64,
}

/// Everything one test-runner invocation produced.
#[derive(Debug, Clone, Default)]
pub struct TestReport {
    pub cases: Vec<TestCase>,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
}

impl TestReport {
    #[cfg(test)]
    pub fn from_cases(cases: Vec<TestCase>) -> Self {
        Self {
            cases,
            ..Self::default()
        }
    }

    pub fn outcome_of(&self, id: &str) -> Option<TestOutcome> {
        self.cases.iter().find(|c| c.id == id).map(|c| c.outcome)
    }

    /// Cases whose outcome is anything but a pass.
    pub fn not_passing(&self) -> impl Iterator<Item = &TestCase> {
        self.cases
            .iter()
            .filter(|c| c.outcome != TestOutcome::Passed)
    }

    pub fn count(&self, outcome: TestOutcome) -> usize {
        self.cases.iter().filter(|c| c.outcome == outcome).count()
    }

    pub fn suites(&self) -> Vec<SuiteSummary> {
        let mut suites: BTreeMap<&str, SuiteSummary> = BTreeMap::new();

        for case in &self.cases {
            let suite = suites
                .entry(case.suite())
                .or_insert_with(|| SuiteSummary {
                    name: case.suite().to_string(),
                    ..SuiteSummary::default()
                });

            suite.total += 1;
            suite.duration_secs += case.duration_secs;
            match case.outcome {
                TestOutcome::Failed => suite.failures += 1,
                TestOutcome::Error => suite.errors += 1,
                TestOutcome::Skipped => suite.skipped += 1,
                TestOutcome::Passed => {}
            }
        }

        suites.into_values().collect()
    }
}

#[derive(Debug, Deserialize)]
struct RawReport {
    #[serde(default)]
    tests: Vec<RawTest>,
    #[serde(default)]
    collectors: Vec<RawCollector>,
}

#[derive(Debug, Deserialize)]
struct RawTest {
    nodeid: String,
    outcome: String,
    setup: Option<RawStage>,
    call: Option<RawStage>,
    teardown: Option<RawStage>,
}

#[derive(Debug, Deserialize)]
struct RawStage {
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    longrepr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCollector {
    nodeid: String,
    outcome: String,
    #[serde(default)]
    longrepr: Option<String>,
}

/// Parse the JSON written by the pytest-json-report plugin.
///
/// A collector that failed (an import error in a test module, for instance)
/// becomes an erroring case so the breakage is not silently lost.
pub fn parse_report(text: &str) -> Result<Vec<TestCase>, serde_json::Error> {
    let raw: RawReport = serde_json::from_str(text)?;

    let mut cases: Vec<TestCase> = raw
        .tests
        .into_iter()
        .map(|t| {
            let stages = [&t.setup, &t.call, &t.teardown];
            let duration_secs: f64 = stages.iter().filter_map(|s| s.as_ref()).map(|s| s.duration).sum();
            let message = stages
                .iter()
                .filter_map(|s| s.as_ref())
                .find_map(|s| s.longrepr.clone())
                .filter(|m| !m.is_empty());

            TestCase {
                outcome: TestOutcome::from_pytest(&t.outcome).unwrap_or(TestOutcome::Error),
                id: t.nodeid,
                message,
                duration_secs,
            }
        })
        .collect();

    cases.extend(
        raw.collectors
            .into_iter()
            .filter(|c| c.outcome == "failed")
            .map(|c| TestCase {
                id: c.nodeid,
                outcome: TestOutcome::Error,
                message: c.longrepr,
                duration_secs: 0.0,
            }),
    );

    Ok(cases)
}

pub fn read_report(path: &Path) -> Result<Vec<TestCase>, TestRunnerError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TestRunnerError::MissingReport(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    parse_report(&text).map_err(|source| TestRunnerError::CorruptReport {
        path: path.to_path_buf(),
        source,
    })
}

/// Test-runner command line with `{tests}` and `{report}` placeholders.
#[derive(Debug, Clone)]
pub struct PytestRunner {
    pub command: String,
    pub tests: PathBuf,
    pub report: PathBuf,
    pub timeout: Option<Duration>,
}

impl PytestRunner {
    fn argv(&self) -> Vec<String> {
        let tests = self.tests.to_string_lossy();
        let report = self.report.to_string_lossy();

        self.command
            .split_whitespace()
            .map(|arg| arg.replace("{tests}", &tests).replace("{report}", &report))
            .collect()
    }

    /// Run the suite once, blocking until it finishes, and read its report.
    ///
    /// The exit code is informational; outcomes come from the report.
    pub fn run(&self) -> Result<TestReport, TestRunnerError> {
        let argv = self.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(TestRunnerError::Launch {
                command: self.command.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        match fs::remove_file(&self.report) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut stdout = tempfile::tempfile()?;
        let mut stderr = tempfile::tempfile()?;

        let start = Instant::now();
        let mut child = Command::new(program)
            .args(args)
            .env(REPORT_ENV, &self.report)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::null())
            .stdout(stdout.try_clone()?)
            .stderr(stderr.try_clone()?)
            .spawn()
            .map_err(|source| TestRunnerError::Launch {
                command: self.command.clone(),
                source,
            })?;

        let status = wait_with_timeout(&mut child, self.timeout)?;
        let duration = start.elapsed();

        let cases = read_report(&self.report)?;

        Ok(TestReport {
            cases,
            exit_code: status,
            duration,
            stdout: read_back(&mut stdout)?,
            stderr: read_back(&mut stderr)?,
        })
    }
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
) -> Result<Option<i32>, TestRunnerError> {
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status.code());
        }

        if let Some(limit) = timeout {
            if start.elapsed() >= limit {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TestRunnerError::Timeout(limit));
            }
        }

        thread::sleep(POLL_INTERVAL);
    }
}

fn read_back(file: &mut fs::File) -> Result<String, TestRunnerError> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "created": 1700000000.0,
        "duration": 0.42,
        "exitcode": 1,
        "root": "/work",
        "summary": {"passed": 2, "failed": 1, "skipped": 1, "total": 4},
        "collectors": [
            {"nodeid": "", "outcome": "passed", "result": []},
            {"nodeid": "tests/test_broken.py", "outcome": "failed", "longrepr": "ImportError: boom", "result": []}
        ],
        "tests": [
            {"nodeid": "tests/test_calc.py::test_add", "lineno": 3, "outcome": "passed",
             "setup": {"duration": 0.01, "outcome": "passed"},
             "call": {"duration": 0.02, "outcome": "passed"},
             "teardown": {"duration": 0.01, "outcome": "passed"}},
            {"nodeid": "tests/test_calc.py::test_sub", "lineno": 7, "outcome": "failed",
             "setup": {"duration": 0.01, "outcome": "passed"},
             "call": {"duration": 0.05, "outcome": "failed", "longrepr": "assert 1 == 3"},
             "teardown": {"duration": 0.0, "outcome": "passed"}},
            {"nodeid": "tests/test_util.py::test_skip", "lineno": 1, "outcome": "skipped",
             "setup": {"duration": 0.0, "outcome": "skipped", "longrepr": "('x', 1, 'Skipped: later')"}},
            {"nodeid": "tests/test_util.py::test_known_bug", "lineno": 9, "outcome": "xfailed"}
        ]
    }"#;

    #[test]
    fn parses_tests_and_failed_collectors() {
        let cases = parse_report(SAMPLE).unwrap();
        let summary: Vec<(&str, TestOutcome)> =
            cases.iter().map(|c| (c.id.as_str(), c.outcome)).collect();

        assert_eq!(
            summary,
            vec![
                ("tests/test_calc.py::test_add", TestOutcome::Passed),
                ("tests/test_calc.py::test_sub", TestOutcome::Failed),
                ("tests/test_util.py::test_skip", TestOutcome::Skipped),
                ("tests/test_util.py::test_known_bug", TestOutcome::Skipped),
                ("tests/test_broken.py", TestOutcome::Error),
            ]
        );
        assert_eq!(cases[1].message.as_deref(), Some("assert 1 == 3"));
        assert!((cases[1].duration_secs - 0.06).abs() < 1e-9);
    }

    #[test]
    fn suites_group_by_file() {
        let report = TestReport::from_cases(parse_report(SAMPLE).unwrap());
        let suites = report.suites();

        let names: Vec<&str> = suites.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["tests/test_broken.py", "tests/test_calc.py", "tests/test_util.py"]
        );
        assert_eq!(suites[1].total, 2);
        assert_eq!(suites[1].failures, 1);
        assert_eq!(suites[2].skipped, 2);
        assert_eq!(report.not_passing().count(), 4);
    }

    #[test]
    fn missing_and_corrupt_reports_are_distinct_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        assert!(matches!(
            read_report(&path),
            Err(TestRunnerError::MissingReport(_))
        ));

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            read_report(&path),
            Err(TestRunnerError::CorruptReport { .. })
        ));
    }

    #[test]
    fn placeholders_are_substituted() {
        let runner = PytestRunner {
            command: DEFAULT_COMMAND.to_string(),
            tests: PathBuf::from("tests"),
            report: PathBuf::from("/out/report.json"),
            timeout: None,
        };
        let argv = runner.argv();
        assert_eq!(argv[..4], ["python3", "-m", "pytest", "tests"]);
        assert_eq!(argv.last().unwrap(), "--json-report-file=/out/report.json");
    }

    #[cfg(unix)]
    #[test]
    fn runs_a_command_and_reads_its_report() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake.sh");
        fs::write(
            &script,
            "#!/bin/sh\necho '{\"tests\": [{\"nodeid\": \"t.py::a\", \"outcome\": \"passed\"}]}' > \"$PY_MUTANT_REPORT\"\nexit 3\n",
        )
        .unwrap();

        let runner = PytestRunner {
            command: format!("sh {}", script.display()),
            tests: PathBuf::from("tests"),
            report: dir.path().join("report.json"),
            timeout: Some(Duration::from_secs(30)),
        };
        let report = runner.run().unwrap();

        assert_eq!(report.exit_code, Some(3));
        assert_eq!(report.outcome_of("t.py::a"), Some(TestOutcome::Passed));
    }

    #[cfg(unix)]
    #[test]
    fn slow_runner_is_killed_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let runner = PytestRunner {
            command: "sleep 10".to_string(),
            tests: PathBuf::from("tests"),
            report: dir.path().join("report.json"),
            timeout: Some(Duration::from_millis(200)),
        };

        let start = Instant::now();
        assert!(matches!(runner.run(), Err(TestRunnerError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
