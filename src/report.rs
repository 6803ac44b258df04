use std::path::Path;

use crate::mutant::{AppliedMutation, MutantStatus};
use crate::run_report::{IterationResult, RunReport};
use crate::ui::Ui;

/// Print a detailed list of all iterations and what they mutated.
pub fn print_all_iterations(ui: &Ui, report: &RunReport) {
    if report.iterations.is_empty() {
        return;
    }

    ui.title("--- iterations (detailed) ---");
    for it in &report.iterations {
        let duration = duration_label(it.duration_ms);
        ui.line(format!(
            "{:>9} {:>8} #{} {}",
            it.status.label(),
            duration,
            it.index,
            summary_label(it)
        ));
        for (file, m) in it.mutations() {
            ui.line(format!("{:>20}{}", "", format_mutation(&file.plan.file, m)));
        }
        if let Some(e) = &it.mutant_error {
            ui.line(format!("{:>20}{e}", ""));
        }
    }
}

/// Print the mutations of every surviving mutant.
///
/// Each line carries the file, the 1-based line and 0-based column of the
/// operator, its category and kind, and the textual replacement.
pub fn print_surviving_mutants(ui: &Ui, report: &RunReport) {
    let survivors: Vec<&IterationResult> = report
        .iterations
        .iter()
        .filter(|it| it.status == MutantStatus::Survived)
        .collect();

    if survivors.is_empty() {
        return;
    }

    ui.title(format!(
        "--- surviving mutants ({} of {}) ---",
        survivors.len(),
        report.iterations.len()
    ));

    for it in survivors {
        for (file, m) in it.mutations() {
            ui.line(format!("#{} {}", it.index, format_mutation(&file.plan.file, m)));
        }
    }
}

/// Print the one-paragraph run summary.
pub fn print_summary(ui: &Ui, report: &RunReport) {
    let t = &report.totals;
    ui.title("--- summary ---");
    ui.line(format!("iterations: {}", t.iterations));
    ui.line(format!("killed:     {}", t.killed));
    ui.line(format!("survived:   {}", t.survived));
    ui.line(format!("errored:    {}", t.errored));
    ui.line(format!("unmutated:  {}", t.unmutated));
    if let Some(score) = t.score() {
        ui.line(format!("score:      {score:.1}%"));
    }
    if report.interrupted {
        ui.warn("run was interrupted; results are partial");
    }
}

/// Format one applied mutation as a single, readable line.
pub fn format_mutation(file: &Path, m: &AppliedMutation) -> String {
    format!("{} {m}", file.display())
}

fn summary_label(it: &IterationResult) -> String {
    let c = &it.counts;
    format!(
        "{} site(s): {} killed, {} survived, {} errored, {} skipped",
        it.mutation_count(),
        c.killed,
        c.survived,
        c.errored,
        c.skipped
    )
}

fn duration_label(duration_ms: Option<u64>) -> String {
    match duration_ms {
        Some(ms) => format!("{ms}ms"),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::MutableSite;
    use crate::operators::{OperatorCategory, OperatorKind};

    #[test]
    fn format_mutation_is_stable() {
        let m = AppliedMutation {
            site: MutableSite {
                line: 4,
                column: 11,
                chain_index: 1,
                category: OperatorCategory::Comparison,
                kind: OperatorKind::NotIn,
            },
            replacement: OperatorKind::In,
            original_text: "not  in".to_string(),
            mutated_text: "in".to_string(),
        };

        insta::assert_snapshot!(
            format_mutation(Path::new("pkg/util.py"), &m),
            @r#"pkg/util.py 4:11 comparison/NotIn -> In: "not  in" -> "in""#
        );
    }

    #[test]
    fn duration_label_falls_back_to_dash() {
        assert_eq!(duration_label(Some(7)), "7ms");
        assert_eq!(duration_label(None), "-");
    }
}
