mod analyze;
mod apply;
mod backup;
mod cli;
mod coverage;
mod error;
mod mutant;
mod operators;
mod options;
mod out;
mod project;
mod pytest;
mod report;
mod run_report;
mod runner;
mod scan;
mod select;
mod source;
mod span;
mod syntax;
mod ui;

/// Entry point for the `py-mutant` binary.
fn main() -> anyhow::Result<()> {
    cli::run()
}
