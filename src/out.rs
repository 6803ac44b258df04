use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::mutant::MutantStatus;
use crate::report::format_mutation;
use crate::run_report::RunReport;

/// Write every artifact of a run into `out_dir`.
pub fn write_all(out_dir: &Path, report: &RunReport) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create output dir {:?}", out_dir))?;

    write_pretty_json(&out_dir.join("report.json"), report)?;
    write_log(out_dir, report)?;
    write_diff_dir(out_dir, report)?;
    write_outcome_txts(out_dir, report)?;
    Ok(())
}

/// Write cargo-mutants-style outcome lists, one mutated site per line:
/// - killed.txt
/// - survived.txt
/// - errored.txt
pub fn write_outcome_txts(out_dir: &Path, report: &RunReport) -> Result<()> {
    write_txt_for(out_dir.join("killed.txt"), report, MutantStatus::Killed)?;
    write_txt_for(out_dir.join("survived.txt"), report, MutantStatus::Survived)?;
    write_txt_for(out_dir.join("errored.txt"), report, MutantStatus::Errored)?;
    Ok(())
}

/// Write `diff/000001.diff` per iteration that changed any file.
pub fn write_diff_dir(out_dir: &Path, report: &RunReport) -> Result<()> {
    let diff_dir = out_dir.join("diff");
    if diff_dir.exists() {
        fs::remove_dir_all(&diff_dir)
            .with_context(|| format!("failed to clear diff dir {:?}", diff_dir))?;
    }
    fs::create_dir_all(&diff_dir)
        .with_context(|| format!("failed to create diff dir {:?}", diff_dir))?;

    for it in &report.iterations {
        let content: String = it.files.iter().map(|f| f.diff.as_str()).collect();
        if content.is_empty() {
            continue;
        }

        let path = diff_dir.join(format!("{:06}.diff", it.index));
        fs::write(&path, content).with_context(|| format!("failed to write {:?}", path))?;
    }

    Ok(())
}

/// Write a stable `log` file (no timestamps): initialization outcome,
/// operator inventory, then plan and classification per iteration.
pub fn write_log(out_dir: &Path, report: &RunReport) -> Result<()> {
    let path = out_dir.join("log");
    fs::write(&path, render_log(report)).with_context(|| format!("failed to write {:?}", path))
}

pub fn render_log(report: &RunReport) -> String {
    let mut lines = Vec::new();
    lines.push(format!("tool: {} {}", report.tool, report.version));
    lines.push(format!("target: {}", report.target.display()));
    lines.push(format!("tests: {}", report.tests.display()));
    lines.push(format!(
        "strategy: {} mutations_per_mutant={} seed={} errors_kill={}",
        report.strategy, report.mutations_per_mutant, report.seed, report.kill_policy.errors_kill
    ));

    match &report.baseline {
        Some(b) => {
            lines.push(format!(
                "baseline: passed={} failed={} errors={} skipped={} exit_code={:?} duration_ms={}",
                b.passed, b.failed, b.errors, b.skipped, b.exit_code, b.duration_ms
            ));
            for case in &b.not_passing {
                lines.push(format!("baseline-not-passing: {:?} {}", case.outcome, case.id));
            }
        }
        None => lines.push("baseline: not run".to_string()),
    }

    for inv in &report.inventory {
        let per_category: Vec<String> = inv
            .sites
            .iter()
            .map(|(category, n)| format!("{category}={n}"))
            .collect();
        lines.push(format!(
            "inventory: {} {} covered={} eligible={}",
            inv.file.display(),
            per_category.join(" "),
            inv.covered,
            inv.eligible
        ));
    }

    for it in &report.iterations {
        lines.push(format!("iteration {}:", it.index));
        for file in &it.files {
            lines.push(format!(
                "  plan: {} eligible={} requested={} selected={}",
                file.plan.file.display(),
                file.plan.eligible,
                file.plan.requested,
                file.plan.sites.len()
            ));
            for m in &file.mutations {
                lines.push(format!("    {m}"));
            }
        }
        for w in &it.warnings {
            lines.push(format!("  warning: {w}"));
        }
        if let Some(e) = &it.mutant_error {
            lines.push(format!("  mutant error: {e}"));
        }
        for case in &it.cases {
            lines.push(format!("  {:<9} {}", case.class.label(), case.id));
        }
        lines.push(format!(
            "  summary: status={} killed={} survived={} errored={} skipped={}",
            it.status.label(),
            it.counts.killed,
            it.counts.survived,
            it.counts.errored,
            it.counts.skipped
        ));
    }

    let t = &report.totals;
    lines.push(format!(
        "summary: iterations={} killed={} survived={} errored={} unmutated={}",
        t.iterations, t.killed, t.survived, t.errored, t.unmutated
    ));
    if report.interrupted {
        lines.push("interrupted: true".to_string());
    }
    if let Some(err) = &report.error {
        lines.push(format!("error: {err}"));
    }

    lines.join("\n") + "\n"
}

fn write_txt_for(path: PathBuf, report: &RunReport, want: MutantStatus) -> Result<()> {
    // The file is created even when the list is empty.
    let mut out = String::new();
    for it in report.iterations.iter().filter(|it| it.status == want) {
        for (file, m) in it.mutations() {
            out.push_str(&format!("#{} {}", it.index, format_mutation(&file.plan.file, m)));
            out.push('\n');
        }
        if let Some(e) = &it.mutant_error {
            out.push_str(&format!("#{} not materialized: {e}\n", it.index));
        }
    }

    fs::write(&path, out).with_context(|| format!("failed to write {:?}", path))?;
    Ok(())
}

// `?Sized` allows passing unsized values such as slices.
fn write_pretty_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize json")?;
    fs::write(path, json).with_context(|| format!("failed to write {:?}", path))?;
    Ok(())
}
