use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use rand::Rng;
use serde::Serialize;

use crate::coverage::CoverageJson;
use crate::operators::OperatorCategory;
use crate::options::{FileConfig, OperatorNames, Options, ScanOptions};
use crate::out::write_all;
use crate::project::Project;
use crate::pytest::PytestRunner;
use crate::report::{print_all_iterations, print_summary, print_surviving_mutants};
use crate::run_report::RunReport;
use crate::runner::{Orchestrator, RunConfig};
use crate::scan::{Inspect, ProjectOverview, scan_project};
use crate::select::Strategy;
use crate::ui::Ui;

const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_SURVIVORS: i32 = 2;

/// Read when `--config` is not given and the file exists in the working dir.
const CONFIG_FILE: &str = "py-mutant.toml";

/// Name of the test runner's report inside the output dir.
const TEST_REPORT_FILE: &str = "pytest-report.json";

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Top-level CLI arguments for the `py-mutant` binary.
#[derive(Debug, Parser)]
#[command(
    name = "py-mutant",
    version,
    about = "Coverage-gated mutation testing for Python"
)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands supported by `py-mutant`.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the mutable operators of the target without running any test.
    Scan {
        #[command(flatten)]
        common: CommonArgs,

        /// Print the source of every analyzed file.
        #[arg(long)]
        print_source: bool,

        /// Print the syntax tree of every analyzed file: node kinds and
        /// operator leaves with their positions.
        #[arg(long)]
        print_tree: bool,
    },

    /// Run mutation testing.
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// Test entry path passed to the runner as `{tests}`.
        #[arg(long)]
        tests: Option<PathBuf>,

        /// How selected operators are rewritten.
        #[arg(long, value_enum)]
        strategy: Option<Strategy>,

        /// Number of mutants to build and test.
        #[arg(long, short = 'n')]
        iterations: Option<usize>,

        /// Operator sites mutated per file in each mutant.
        #[arg(long, short = 'k')]
        mutations: Option<usize>,

        /// Seed for site selection; a random one is drawn and reported otherwise.
        #[arg(long)]
        seed: Option<u64>,

        /// Test runner command; `{tests}` and `{report}` are substituted.
        #[arg(long)]
        runner: Option<String>,

        /// Directory for the log, report, diffs and backup.
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Kill the test runner and fail the run after this many seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Count tests that error under a mutant as kills.
        #[arg(long)]
        errors_kill: bool,

        /// Leave the backup copy of the target in the output dir.
        #[arg(long)]
        keep_backup: bool,

        /// Exit with code 2 if any mutants survive (useful for CI).
        #[arg(long)]
        fail_on_survivors: bool,

        /// Print the full source of every file a mutant rewrote.
        #[arg(long)]
        print_mutants: bool,
    },
}

/// Arguments shared by `scan` and `run`.
#[derive(Debug, Args)]
pub struct CommonArgs {
    /// Directory of Python sources, or a single `.py` file, to mutate.
    pub target: Option<PathBuf>,

    /// TOML config file; its values are overridden by flags.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// coverage.py JSON report (`coverage json`).
    #[arg(long)]
    pub coverage: Option<PathBuf>,

    /// Approved unary operators, e.g. `UAdd,USub`.
    #[arg(long, value_delimiter = ',')]
    pub unary: Option<Vec<String>>,

    /// Approved binary operators, e.g. `Add,Sub,Mult,Div`.
    #[arg(long, value_delimiter = ',')]
    pub binary: Option<Vec<String>>,

    /// Approved boolean operators, e.g. `And,Or`.
    #[arg(long, value_delimiter = ',')]
    pub boolean: Option<Vec<String>>,

    /// Approved comparison operators, e.g. `Lt,Gt`.
    #[arg(long, value_delimiter = ',')]
    pub comparison: Option<Vec<String>>,

    /// Show per-file inventory, plans and per-test classification.
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Emit a machine-readable JSON report to stdout.
    #[arg(long)]
    pub json: bool,
}

impl CommonArgs {
    fn overrides(&self) -> FileConfig {
        FileConfig {
            target: self.target.clone(),
            coverage: self.coverage.clone(),
            verbose: self.verbose.then_some(true),
            operators: OperatorNames {
                unary: self.unary.clone(),
                binary: self.binary.clone(),
                boolean: self.boolean.clone(),
                comparison: self.comparison.clone(),
            },
            ..FileConfig::default()
        }
    }

    /// Config file values with the flags layered on top.
    fn load_config(&self, flags: FileConfig) -> Result<FileConfig> {
        let file = match &self.config {
            Some(path) => FileConfig::from_toml_file(path)?,
            None if Path::new(CONFIG_FILE).is_file() => {
                FileConfig::from_toml_file(Path::new(CONFIG_FILE))?
            }
            None => FileConfig::default(),
        };
        Ok(file.merge(flags))
    }
}

fn install_interrupt_handler() -> Result<()> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();

    let result = INIT.get_or_init(|| {
        ctrlc::set_handler(|| {
            INTERRUPTED.store(true, Ordering::SeqCst);
        })
        .map_err(|e| e.to_string())
    });

    match result {
        Ok(()) => Ok(()),
        Err(msg) => Err(anyhow!("failed to install Ctrl-C handler: {msg}")),
    }
}

fn print_json_and_exit<T: Serialize>(value: &T, exit_code: i32) -> ! {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to serialize report: {e}"),
    }
    std::process::exit(exit_code);
}

/// In `--json` mode a failure still produces a JSON document on stdout.
fn fail(ui: &Ui, json: bool, e: anyhow::Error) -> Result<()> {
    if json {
        ui.error(format!("error: {e:#}"));
        print_json_and_exit(&serde_json::json!({ "error": format!("{e:#}") }), EXIT_ERROR);
    }
    Err(e)
}

/// Parse CLI arguments and dispatch the selected command.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Scan {
            common,
            print_source,
            print_tree,
        } => {
            let json = common.json;
            let ui = Ui::new(json, common.verbose);

            let options = match common
                .load_config(common.overrides())
                .and_then(|c| Ok(ScanOptions::from_config(c)?))
            {
                Ok(o) => o,
                Err(e) => return fail(&ui, json, e),
            };
            let ui = Ui::new(json, options.verbose);

            ui.title("py-mutant: scan");
            ui.line(format!("target: {:?}", options.target));

            let overview = CoverageJson::from_json_file(&options.coverage)
                .map_err(anyhow::Error::from)
                .and_then(|coverage| {
                    let inspect = Inspect {
                        source: print_source,
                        tree: print_tree,
                    };
                    scan_project(&options.target, &coverage, &options.operators, inspect, &ui)
                });

            match overview {
                Ok(overview) if json => print_json_and_exit(&overview, EXIT_OK),
                Ok(overview) => {
                    print_scan_summary(&ui, &overview);
                    Ok(())
                }
                Err(e) => {
                    let e = e.context(format!("failed to scan {:?}", options.target));
                    fail(&ui, json, e)
                }
            }
        }

        Command::Run {
            common,
            tests,
            strategy,
            iterations,
            mutations,
            seed,
            runner,
            out_dir,
            timeout_secs,
            errors_kill,
            keep_backup,
            fail_on_survivors,
            print_mutants,
        } => {
            let json = common.json;
            let bootstrap_ui = Ui::new(json, common.verbose);

            let flags = FileConfig {
                tests,
                strategy,
                iterations,
                mutations,
                seed,
                runner,
                out_dir,
                timeout_secs,
                errors_kill: errors_kill.then_some(true),
                keep_backup: keep_backup.then_some(true),
                ..common.overrides()
            };
            let options = match common
                .load_config(flags)
                .and_then(|c| Ok(Options::from_config(c)?))
            {
                Ok(o) => o,
                Err(e) => return fail(&bootstrap_ui, json, e),
            };

            let mut ui = Ui::new(json, options.verbose);
            run_mutation(&options, &mut ui, json, fail_on_survivors, print_mutants)
        }
    }
}

fn run_mutation(
    options: &Options,
    ui: &mut Ui,
    json: bool,
    fail_on_survivors: bool,
    print_mutants: bool,
) -> Result<()> {
    ui.title("py-mutant: run");
    ui.line(format!("target: {:?}", options.target));

    let project = match CoverageJson::from_json_file(&options.coverage)
        .and_then(|coverage| Project::load(&options.target, &coverage))
    {
        Ok(p) => p,
        Err(e) => {
            let e = anyhow::Error::from(e)
                .context(format!("failed to load Python target {:?}", options.target));
            return fail(ui, json, e);
        }
    };

    if project.sources.is_empty() {
        ui.run_warning(format!(
            "coverage lists no existing .py file under {:?}; nothing can be mutated",
            project.target
        ));
    }

    let seed = options.seed.unwrap_or_else(|| rand::rng().random());
    ui.line(format!("seed: {seed}"));

    if let Err(e) = install_interrupt_handler() {
        return fail(ui, json, e);
    }

    let out_dir = std::path::absolute(&options.out_dir)
        .with_context(|| format!("invalid output dir {:?}", options.out_dir))?;

    let config = RunConfig {
        tests: options.tests.clone(),
        out_dir: out_dir.clone(),
        strategy: options.strategy,
        iterations: options.iterations,
        mutations: options.mutations,
        operators: options.operators.clone(),
        kill_policy: options.kill_policy,
        keep_backup: options.keep_backup,
        print_mutants,
        seed,
    };
    let runner = PytestRunner {
        command: options.runner.clone(),
        tests: options.tests.clone(),
        report: out_dir.join(TEST_REPORT_FILE),
        timeout: options.timeout,
    };

    let mut orchestrator = Orchestrator::new(&config, runner, ui, &INTERRUPTED);
    let outcome = orchestrator.run(&project);
    let partial = orchestrator.take_partial_report();
    drop(orchestrator);

    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            if let Some(partial) = &partial {
                persist(ui, &out_dir, partial);
            }
            if json {
                ui.error(format!("error: {e:#}"));
                match &partial {
                    Some(partial) => print_json_and_exit(partial, EXIT_ERROR),
                    None => print_json_and_exit(
                        &serde_json::json!({ "error": format!("{e:#}") }),
                        EXIT_ERROR,
                    ),
                }
            }
            return Err(e);
        }
    };

    persist(ui, &out_dir, &report);

    // CI policy
    let wants_ci_fail = fail_on_survivors && report.totals.survived > 0;
    let exit_code = if report.interrupted {
        EXIT_ERROR
    } else if wants_ci_fail {
        EXIT_SURVIVORS
    } else {
        EXIT_OK
    };

    if json {
        print_json_and_exit(&report, exit_code);
    }

    print_summary(ui, &report);
    if options.verbose {
        print_all_iterations(ui, &report);
    }
    print_surviving_mutants(ui, &report);
    if ui.warning_count() > 0 {
        ui.warn(format!("{} warning(s); see the log for details", ui.warning_count()));
    }
    ui.line(format!("artifacts: {}", out_dir.display()));

    if report.interrupted {
        ui.error("mutation run was interrupted");
        std::process::exit(EXIT_ERROR);
    }

    if wants_ci_fail {
        ui.error(format!(
            "mutation testing failed policy: {} mutant(s) survived (--fail-on-survivors)",
            report.totals.survived
        ));
        std::process::exit(EXIT_SURVIVORS);
    }

    Ok(())
}

/// Artifacts are best effort once the run itself is over.
fn persist(ui: &Ui, out_dir: &Path, report: &RunReport) {
    if let Err(e) = write_all(out_dir, report) {
        ui.warn(format!("warning: failed to write artifacts: {e:#}"));
    }
}

/// Print a short summary based on the project overview.
fn print_scan_summary(ui: &Ui, overview: &ProjectOverview) {
    ui.title("--- operator inventory ---");
    ui.line(format!("target:           {}", overview.target.display()));
    ui.line(format!("py files (.py):   {}", overview.py_files));
    for category in OperatorCategory::ALL {
        let n = overview.sites.get(&category).copied().unwrap_or(0);
        ui.line(format!("{:<17} {n}", format!("{category} sites:")));
    }
    ui.line(format!("total sites:      {}", overview.total_sites()));
    ui.line(format!("covered sites:    {}", overview.covered_sites));
    ui.line(format!("eligible sites:   {}", overview.eligible_sites));

    for inv in &overview.files {
        ui.detail(format!(
            "{}: {} site(s), {} covered, {} eligible",
            inv.file.display(),
            inv.total(),
            inv.covered,
            inv.eligible
        ));
    }
}
