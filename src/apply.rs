use std::collections::BTreeMap;

use rand::Rng;

use crate::analyze::{AnalysisResult, MutableSite};
use crate::mutant::{AppliedMutation, ApplicatorWarning, Mutant};
use crate::operators::{OperatorCategory, OperatorKind, OperatorSets};
use crate::select::{MutationPlan, Strategy};
use crate::syntax::TokenKind;

/// Rewrite the planned sites on a fresh copy of the analyzed tree.
///
/// The analyzed tree is untouched. Sites are matched by their original
/// line, column and chain index; children are rewritten before parents.
pub fn apply_plan<R: Rng + ?Sized>(
    analysis: &AnalysisResult,
    plan: &MutationPlan,
    operators: &OperatorSets,
    rng: &mut R,
) -> Mutant {
    let wanted: BTreeMap<(u32, u32, usize), MutableSite> = plan
        .sites
        .iter()
        .map(|s| ((s.line, s.column, s.chain_index), *s))
        .collect();

    let mut tree = analysis.tree.clone();
    let mut mutations = Vec::new();
    let mut notes = Vec::new();

    tree.rewrite_operators(&mut |_, chain_index, token| {
        let TokenKind::Operator(kind) = token.kind else {
            return;
        };
        let Some(site) = wanted.get(&(token.pos.line, token.pos.column, chain_index)) else {
            return;
        };
        if site.kind != kind {
            return;
        }

        let replacement = match plan.strategy {
            Strategy::Deterministic => match kind.complement() {
                Some(k) => k,
                None => {
                    notes.push(ApplicatorWarning::NoComplement(*site));
                    return;
                }
            },
            Strategy::Random => {
                let alternatives: Vec<OperatorKind> = operators
                    .approved(site.category)
                    .iter()
                    .copied()
                    .filter(|k| *k != kind)
                    .collect();
                if alternatives.is_empty() {
                    notes.push(ApplicatorWarning::NoAlternative(*site));
                    return;
                }
                alternatives[rng.random_range(0..alternatives.len())]
            }
        };

        let mutated_text = spell(site.category, kind, replacement);
        mutations.push(AppliedMutation {
            site: *site,
            replacement,
            original_text: token.text.clone(),
            mutated_text: mutated_text.clone(),
        });

        token.kind = TokenKind::Operator(replacement);
        token.text = mutated_text;
    });

    tree.fix_positions();
    mutations.sort_by_key(|m| m.site);

    Mutant {
        file: analysis.file.clone(),
        tree,
        mutations,
        notes,
    }
}

/// Spelling of `replacement`, padded when a word operator takes the place
/// of a symbol (`-x` becomes `not x`, `a<b` becomes `a is b`).
fn spell(category: OperatorCategory, original: OperatorKind, replacement: OperatorKind) -> String {
    let text = replacement.spelling();

    if !replacement.is_word() || original.is_word() {
        return text.to_string();
    }

    match category {
        OperatorCategory::Unary => format!("{text} "),
        _ => format!(" {text} "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::analyze_source;
    use crate::select::{MutationRequest, select};
    use crate::syntax::serialize;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::path::Path;

    fn analysis(src: &str) -> AnalysisResult {
        let lines = src.lines().count() as u32;
        analyze_source(
            Path::new("m.py"),
            Path::new("/tmp/m.py"),
            src.to_string(),
            (1..=lines).collect(),
        )
        .unwrap()
    }

    fn mutate(
        a: &AnalysisResult,
        strategy: Strategy,
        count: usize,
        ops: &OperatorSets,
        seed: u64,
    ) -> (String, Mutant) {
        let mut rng = StdRng::seed_from_u64(seed);
        let request = MutationRequest {
            strategy,
            count,
            target: a,
        };
        let plan = select(&request, ops, &mut rng);
        let mutant = apply_plan(a, &plan, ops, &mut rng);
        (serialize(&mutant.tree).unwrap(), mutant)
    }

    #[test]
    fn deterministic_complement_of_addition() {
        let a = analysis("def f(a, b):\n    return a + b\n");
        let (text, mutant) = mutate(&a, Strategy::Deterministic, 1, &OperatorSets::default(), 0);

        assert_eq!(text, "def f(a, b):\n    return a - b\n");
        assert_eq!(mutant.mutations.len(), 1);
        assert_eq!(mutant.mutations[0].replacement, OperatorKind::Sub);
        assert_eq!(serialize(&a.tree).unwrap(), a.source, "original tree untouched");
    }

    #[test]
    fn one_operator_of_a_chain_is_flipped() {
        let a = analysis("ok = a < b < c\n");
        let mut ops = OperatorSets::default();
        ops.set(
            OperatorCategory::Comparison,
            vec![OperatorKind::Lt, OperatorKind::Gt],
        )
        .unwrap();

        let mut seen = Vec::new();
        for seed in 0..16 {
            let (text, mutant) = mutate(&a, Strategy::Deterministic, 1, &ops, seed);
            assert!(
                text == "ok = a > b < c\n" || text == "ok = a < b > c\n",
                "unexpected mutant {text:?}"
            );
            seen.push(mutant.mutations[0].site.chain_index);
        }
        assert!(seen.contains(&0) && seen.contains(&1));
    }

    #[test]
    fn double_complement_restores_original() {
        let src = "r = a + b if x is not None and y in z else c << d\n";
        let a = analysis(src);
        let ops = OperatorSets::default();
        let (once, _) = mutate(&a, Strategy::Deterministic, 10, &ops, 3);
        assert_ne!(once, src);

        let b = analysis(&once);
        let (twice, _) = mutate(&b, Strategy::Deterministic, 10, &ops, 3);
        assert_eq!(twice, src);
    }

    #[test]
    fn random_never_reselects_the_original_kind() {
        let a = analysis("r = a + b - c * d / e\n");
        let ops = OperatorSets::default();

        for seed in 0..50 {
            let (_, mutant) = mutate(&a, Strategy::Random, 4, &ops, seed);
            for m in &mutant.mutations {
                assert_ne!(m.replacement, m.site.kind);
                assert!(ops.allows(m.replacement));
            }
        }
    }

    #[test]
    fn random_without_alternative_leaves_node_and_notes_it() {
        let a = analysis("r = a + b\n");
        let mut ops = OperatorSets::default();
        ops.set(OperatorCategory::Binary, vec![OperatorKind::Add]).unwrap();

        let (text, mutant) = mutate(&a, Strategy::Random, 1, &ops, 0);
        assert_eq!(text, "r = a + b\n");
        assert!(mutant.mutations.is_empty());
        assert!(matches!(mutant.notes[..], [ApplicatorWarning::NoAlternative(_)]));
    }

    #[test]
    fn word_operator_replacing_symbol_is_padded() {
        assert_eq!(
            spell(OperatorCategory::Unary, OperatorKind::USub, OperatorKind::Not),
            "not "
        );
        assert_eq!(
            spell(OperatorCategory::Comparison, OperatorKind::Lt, OperatorKind::IsNot),
            " is not "
        );
        assert_eq!(
            spell(OperatorCategory::Comparison, OperatorKind::NotIn, OperatorKind::In),
            "in"
        );
    }

    #[test]
    fn positions_are_recomputed_after_rewrite() {
        let a = analysis("ok = a<b and c<d\n");
        let mut ops = OperatorSets::default();
        ops.set(OperatorCategory::Comparison, vec![OperatorKind::Lt, OperatorKind::Is])
            .unwrap();
        ops.set(OperatorCategory::Boolean, vec![]).unwrap();

        let plan = MutationPlan {
            file: a.file.clone(),
            strategy: Strategy::Random,
            sites: vec![a.all_sites()[0]],
            eligible: 1,
            requested: 1,
            warning: None,
        };
        let mutant = apply_plan(&a, &plan, &ops, &mut StdRng::seed_from_u64(0));

        assert_eq!(serialize(&mutant.tree).unwrap(), "ok = a is b and c<d\n");
        let last = *mutant.tree.operators().last().unwrap();
        assert_eq!(last.position.column, 17);
    }
}
