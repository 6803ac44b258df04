use console::{Term, style};
use std::{env, fmt::Display};

use crate::mutant::MutantStatus;
use crate::run_report::IterationResult;

/// Small UI helper:
/// - normal mode: human output to stdout, warnings and errors to stderr
/// - `--json` mode: ALL human output to stderr (stdout stays machine-readable JSON)
/// - `--verbose`: detail lines (plans, per-test classification) are shown
/// - fancy styling only on a real TTY and when NO_COLOR/CI are not set
#[derive(Debug, Clone)]
pub struct Ui {
    out: Term,
    err: Term,
    fancy: bool,
    enabled: bool,
    verbose: bool,

    // Running mutant tally shown on fancy progress lines.
    progress_killed: u64,
    progress_survived: u64,
    progress_errored: u64,
    warnings: u64,
}

impl Ui {
    pub fn new(json: bool, verbose: bool) -> Self {
        let out = if json { Term::stderr() } else { Term::stdout() };
        let err = Term::stderr();

        let out_is_tty = out.is_term();
        let no_color = env::var_os("NO_COLOR").is_some();
        let in_ci = env::var_os("CI").is_some();

        Self {
            out,
            err,
            fancy: out_is_tty && !no_color && !in_ci,
            enabled: true,
            verbose,
            progress_killed: 0,
            progress_survived: 0,
            progress_errored: 0,
            warnings: 0,
        }
    }

    /// Kept behind cfg(test) so it doesn't trigger dead_code in `cargo run`.
    #[cfg(test)]
    pub fn silent() -> Self {
        Self {
            out: Term::stdout(),
            err: Term::stderr(),
            fancy: false,
            enabled: false,
            verbose: true,
            progress_killed: 0,
            progress_survived: 0,
            progress_errored: 0,
            warnings: 0,
        }
    }

    fn write_out(&self, s: &str) {
        if self.enabled {
            let _ = self.out.write_line(s);
        }
    }

    fn write_err(&self, s: &str) {
        if self.enabled {
            let _ = self.err.write_line(s);
        }
    }

    pub fn line(&self, msg: impl Display) {
        self.write_out(&msg.to_string());
    }

    pub fn title(&self, msg: impl Display) {
        let s = msg.to_string();
        if self.fancy {
            self.write_out(&style(s).bold().to_string());
        } else {
            self.write_out(&s);
        }
    }

    /// Only shown with `--verbose`.
    pub fn detail(&self, msg: impl Display) {
        if !self.verbose {
            return;
        }
        let s = msg.to_string();
        if self.fancy {
            self.write_out(&style(s).dim().to_string());
        } else {
            self.write_out(&s);
        }
    }

    pub fn warn(&self, msg: impl Display) {
        let s = msg.to_string();
        if self.fancy {
            self.write_err(&style(s).yellow().to_string());
        } else {
            self.write_err(&s);
        }
    }

    pub fn error(&self, msg: impl Display) {
        let s = msg.to_string();
        if self.fancy {
            self.write_err(&style(s).red().bold().to_string());
        } else {
            self.write_err(&s);
        }
    }

    /// Warning that also counts towards the run's warning tally.
    pub fn run_warning(&mut self, msg: impl Display) {
        self.warnings += 1;
        self.warn(format!("warning: {msg}"));
    }

    /// One line per finished iteration.
    ///
    /// In non-fancy mode the lines are plain and stable so CLI snapshots
    /// (which set NO_COLOR=1) do not depend on the terminal.
    pub fn iteration_progress(&mut self, it: &IterationResult) {
        match it.status {
            MutantStatus::Killed => self.progress_killed = self.progress_killed.saturating_add(1),
            MutantStatus::Survived => {
                self.progress_survived = self.progress_survived.saturating_add(1)
            }
            MutantStatus::Errored => {
                self.progress_errored = self.progress_errored.saturating_add(1)
            }
            MutantStatus::Unmutated => {}
        }

        let sites = it.mutation_count();
        let counts = format!(
            "{} killed, {} survived, {} errored, {} skipped",
            it.counts.killed, it.counts.survived, it.counts.errored, it.counts.skipped
        );

        if !self.fancy {
            self.line(format!(
                "iteration {} {} ({} site(s) mutated; tests: {})",
                it.index,
                it.status.label(),
                sites,
                counts
            ));
            return;
        }

        let tag = match it.status {
            MutantStatus::Killed => style("KILLED").red().bold(),
            MutantStatus::Survived => style("SURVIVED").green().bold(),
            MutantStatus::Errored => style("ERRORED").yellow().bold(),
            MutantStatus::Unmutated => style("UNMUTATED").dim(),
        };

        let dur = it
            .duration_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".to_string());

        self.line(format!(
            "{tag} {dur:>7}  #{index} {sites} site(s)  {counts}  [{k}/{s}/{e} so far]",
            index = it.index,
            k = self.progress_killed,
            s = self.progress_survived,
            e = self.progress_errored,
        ));
    }

    pub fn warning_count(&self) -> u64 {
        self.warnings
    }

    #[cfg(test)]
    pub fn is_fancy(&self) -> bool {
        self.fancy && self.enabled
    }
}
