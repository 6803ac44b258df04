use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::analyze::MutableSite;
use crate::operators::OperatorKind;
use crate::pytest::TestOutcome;
use crate::syntax::SyntaxTree;

/// One operator that was actually rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMutation {
    pub site: MutableSite,
    pub replacement: OperatorKind,
    /// Operator text before the rewrite, as it appeared in the source.
    pub original_text: String,
    /// Operator text after the rewrite, padding included.
    pub mutated_text: String,
}

impl fmt::Display for AppliedMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {}/{} -> {}: {:?} -> {:?}",
            self.site.line,
            self.site.column,
            self.site.category,
            self.site.kind,
            self.replacement,
            self.original_text,
            self.mutated_text,
        )
    }
}

/// Why a selected site was left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApplicatorWarning {
    /// Deterministic strategy, but the kind has no complement.
    NoComplement(MutableSite),

    /// Random strategy, but the approved set offers no other kind.
    NoAlternative(MutableSite),
}

impl fmt::Display for ApplicatorWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicatorWarning::NoComplement(site) => write!(
                f,
                "{}:{} {} has no complement; left unchanged",
                site.line, site.column, site.kind
            ),
            ApplicatorWarning::NoAlternative(site) => write!(
                f,
                "{}:{} no other approved {} operator to replace {} with; left unchanged",
                site.line, site.column, site.category, site.kind
            ),
        }
    }
}

/// A mutated, independently owned copy of one file's tree.
#[derive(Debug, Clone)]
pub struct Mutant {
    pub file: PathBuf,
    pub tree: SyntaxTree,
    pub mutations: Vec<AppliedMutation>,
    pub notes: Vec<ApplicatorWarning>,
}

/// Classification of one test case under one mutant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TestClass {
    /// Passed before mutation, fails now.
    Killed,

    /// Still passes.
    Survived,

    /// Raised an unexpected error under mutation.
    Errored,

    /// Skipped, or carried no signal because it did not pass before.
    Skipped,
}

impl TestClass {
    pub fn label(self) -> &'static str {
        match self {
            TestClass::Killed => "killed",
            TestClass::Survived => "survived",
            TestClass::Errored => "errored",
            TestClass::Skipped => "skipped",
        }
    }
}

/// Outcome of one iteration as a whole.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MutantStatus {
    /// At least one test case was killed.
    Killed,

    /// Every signalling test case still passed.
    Survived,

    /// The mutant could not be materialized, or tests errored without a kill.
    Errored,

    /// No site was mutated, so no tests were run.
    Unmutated,
}

impl MutantStatus {
    pub fn label(self) -> &'static str {
        match self {
            MutantStatus::Killed => "killed",
            MutantStatus::Survived => "survived",
            MutantStatus::Errored => "errored",
            MutantStatus::Unmutated => "unmutated",
        }
    }
}

/// How test outcomes under a mutant map to classifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KillPolicy {
    /// Count an erroring test as a kill instead of keeping it distinct.
    pub errors_kill: bool,
}

impl KillPolicy {
    /// Classify one test case. `baseline` is the outcome on the unmutated
    /// corpus; a test missing from the baseline counts as having passed.
    pub fn classify(self, baseline: Option<TestOutcome>, now: TestOutcome) -> TestClass {
        if baseline.is_some_and(|b| b != TestOutcome::Passed) {
            return TestClass::Skipped;
        }

        match now {
            TestOutcome::Passed => TestClass::Survived,
            TestOutcome::Failed => TestClass::Killed,
            TestOutcome::Error if self.errors_kill => TestClass::Killed,
            TestOutcome::Error => TestClass::Errored,
            TestOutcome::Skipped => TestClass::Skipped,
        }
    }

    /// Roll per-test classifications up into an iteration status.
    pub fn status(self, classes: impl IntoIterator<Item = TestClass>, mutant_error: bool) -> MutantStatus {
        let mut errored = mutant_error;
        for class in classes {
            match class {
                TestClass::Killed => return MutantStatus::Killed,
                TestClass::Errored => errored = true,
                TestClass::Survived | TestClass::Skipped => {}
            }
        }

        if errored {
            MutantStatus::Errored
        } else {
            MutantStatus::Survived
        }
    }
}

/// Single-hunk line diff between two versions of a file.
///
/// Mutations only rewrite operators, so one hunk spanning the first to the
/// last changed line is enough.
pub fn line_diff(file: &str, before: &str, after: &str) -> String {
    let old: Vec<&str> = before.lines().collect();
    let new: Vec<&str> = after.lines().collect();

    let prefix = old
        .iter()
        .zip(&new)
        .take_while(|(a, b)| a == b)
        .count();

    if prefix == old.len() && prefix == new.len() {
        return String::new();
    }

    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let removed = &old[prefix..old.len() - suffix];
    let added = &new[prefix..new.len() - suffix];

    let mut out = format!(
        "--- a/{file}\n+++ b/{file}\n@@ -{},{} +{},{} @@\n",
        prefix + 1,
        removed.len(),
        prefix + 1,
        added.len()
    );
    for line in removed {
        out.push_str(&format!("-{line}\n"));
    }
    for line in added {
        out.push_str(&format!("+{line}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_baseline() {
        let policy = KillPolicy::default();
        let passed = Some(TestOutcome::Passed);

        assert_eq!(policy.classify(passed, TestOutcome::Failed), TestClass::Killed);
        assert_eq!(policy.classify(passed, TestOutcome::Passed), TestClass::Survived);
        assert_eq!(policy.classify(passed, TestOutcome::Error), TestClass::Errored);
        assert_eq!(policy.classify(passed, TestOutcome::Skipped), TestClass::Skipped);
        assert_eq!(policy.classify(None, TestOutcome::Failed), TestClass::Killed);
        assert_eq!(
            policy.classify(Some(TestOutcome::Failed), TestOutcome::Failed),
            TestClass::Skipped
        );
    }

    #[test]
    fn errors_can_count_as_kills() {
        let policy = KillPolicy { errors_kill: true };
        assert_eq!(
            policy.classify(Some(TestOutcome::Passed), TestOutcome::Error),
            TestClass::Killed
        );
    }

    #[test]
    fn status_prefers_kills_over_errors() {
        let policy = KillPolicy::default();
        use TestClass::*;

        assert_eq!(policy.status([Survived, Killed, Errored], false), MutantStatus::Killed);
        assert_eq!(policy.status([Survived, Errored], false), MutantStatus::Errored);
        assert_eq!(policy.status([Survived, Skipped], false), MutantStatus::Survived);
        assert_eq!(policy.status([], true), MutantStatus::Errored);
    }

    #[test]
    fn diff_has_one_hunk() {
        let before = "def f(a, b):\n    return a + b\n\nx = 1\n";
        let after = "def f(a, b):\n    return a - b\n\nx = 1\n";

        assert_eq!(
            line_diff("calc.py", before, after),
            "--- a/calc.py\n+++ b/calc.py\n@@ -2,1 +2,1 @@\n-    return a + b\n+    return a - b\n"
        );
        assert_eq!(line_diff("calc.py", before, before), "");
    }
}
