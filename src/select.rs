use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use clap::ValueEnum;
use rand::Rng;
use rand::seq::index::sample;
use serde::{Deserialize, Serialize};

use crate::analyze::{AnalysisResult, MutableSite};
use crate::operators::OperatorSets;

/// How a selected operator is rewritten.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Replace with the fixed complement (`+` -> `-`).
    #[default]
    Deterministic,

    /// Replace with another approved operator of the same category.
    Random,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Deterministic => f.write_str("deterministic"),
            Strategy::Random => f.write_str("random"),
        }
    }
}

/// One mutant's worth of selection input.
#[derive(Debug, Clone, Copy)]
pub struct MutationRequest<'a> {
    pub strategy: Strategy,
    /// Number of sites to mutate (K).
    pub count: usize,
    pub target: &'a AnalysisResult,
}

/// More sites were requested than are eligible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionWarning {
    pub file: PathBuf,
    pub requested: usize,
    pub eligible: usize,
}

impl fmt::Display for SelectionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: requested {} mutation(s) but only {} site(s) are eligible; mutating all of them",
            self.file.display(),
            self.requested,
            self.eligible
        )
    }
}

/// Sites chosen for one mutant of one file, in traversal order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationPlan {
    pub file: PathBuf,
    pub strategy: Strategy,
    pub sites: Vec<MutableSite>,
    pub eligible: usize,
    pub requested: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<SelectionWarning>,
}

/// Sites that have a complement, are approved and sit on a covered line.
pub fn eligible_sites(analysis: &AnalysisResult, operators: &OperatorSets) -> Vec<MutableSite> {
    analysis
        .all_sites()
        .into_iter()
        .filter(|site| {
            site.kind.complement().is_some()
                && operators.allows(site.kind)
                && analysis.is_covered(site)
        })
        .collect()
}

/// Pick exactly `min(K, eligible)` sites uniformly at random.
///
/// Implemented as removal: `eligible - K` sites are sampled without
/// replacement and dropped, the rest keep their traversal order.
pub fn select<R: Rng + ?Sized>(
    request: &MutationRequest<'_>,
    operators: &OperatorSets,
    rng: &mut R,
) -> MutationPlan {
    let eligible = eligible_sites(request.target, operators);
    let n = eligible.len();

    let warning = (request.count > n).then(|| SelectionWarning {
        file: request.target.file.clone(),
        requested: request.count,
        eligible: n,
    });

    let keep = request.count.min(n);
    let dropped: BTreeSet<usize> = sample(rng, n, n - keep).into_iter().collect();

    let sites = eligible
        .iter()
        .enumerate()
        .filter(|(i, _)| !dropped.contains(i))
        .map(|(_, site)| *site)
        .collect();

    MutationPlan {
        file: request.target.file.clone(),
        strategy: request.strategy,
        sites,
        eligible: n,
        requested: request.count,
        warning,
    }
}
