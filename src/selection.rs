//! Policies deciding which candidates survive a selection round.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::leaderboard::{Candidate, Leaderboard, SortMetric};
use crate::work::Algo;

/// Outcome of a selection round.
///
/// `add` holds new candidates best-first; `remove` holds old candidates
/// worst-first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub add: Vec<Candidate>,
    pub remove: Vec<Candidate>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    pub fn added_ids(&self) -> Vec<String> {
        self.add.iter().map(|c| c.id.clone()).collect()
    }

    pub fn removed_ids(&self) -> Vec<String> {
        self.remove.iter().map(|c| c.id.clone()).collect()
    }
}

pub trait SelectionStrategy: Send + Sync {
    fn select(&self, old: &[Candidate], new: &[Candidate]) -> Selection;
}

/// Keeps the best `n` candidates of `old ∪ new`.
#[derive(Debug, Clone)]
pub struct KeepBestN {
    n: usize,
    sort: SortMetric,
}

impl KeepBestN {
    pub fn new(n: usize, sort: SortMetric) -> Self {
        Self { n, sort }
    }
}

impl SelectionStrategy for KeepBestN {
    fn select(&self, old: &[Candidate], new: &[Candidate]) -> Selection {
        keep_best(self.n, &self.sort, old, new)
    }
}

/// Keeps as many candidates as `old` had.
#[derive(Debug, Clone)]
pub struct KeepBestConstantSize {
    sort: SortMetric,
}

impl KeepBestConstantSize {
    pub fn new(sort: SortMetric) -> Self {
        Self { sort }
    }
}

impl SelectionStrategy for KeepBestConstantSize {
    fn select(&self, old: &[Candidate], new: &[Candidate]) -> Selection {
        keep_best(old.len(), &self.sort, old, new)
    }
}

/// [`KeepBestN`] restricted to the candidates matching a membership
/// predicate; candidates outside the subgroup are left untouched.
pub struct KeepBestNFromSubgroup {
    n: usize,
    sort: SortMetric,
    membership: Box<dyn Fn(&Candidate) -> bool + Send + Sync>,
}

impl KeepBestNFromSubgroup {
    pub fn new(
        n: usize,
        sort: SortMetric,
        membership: impl Fn(&Candidate) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            n,
            sort,
            membership: Box::new(membership),
        }
    }
}

impl SelectionStrategy for KeepBestNFromSubgroup {
    fn select(&self, old: &[Candidate], new: &[Candidate]) -> Selection {
        let old: Vec<Candidate> = old.iter().filter(|c| (self.membership)(*c)).cloned().collect();
        let new: Vec<Candidate> = new.iter().filter(|c| (self.membership)(*c)).cloned().collect();
        keep_best(self.n, &self.sort, &old, &new)
    }
}

fn keep_best(n: usize, sort: &SortMetric, old: &[Candidate], new: &[Candidate]) -> Selection {
    let board = Leaderboard::new("selection", Some(sort.clone()));
    board.insert(old.iter().cloned());
    board.insert(new.iter().cloned());

    let ranked = board.models();
    let target: HashSet<&str> = ranked.iter().take(n).map(|c| c.id.as_str()).collect();
    let old_ids: HashSet<&str> = old.iter().map(|c| c.id.as_str()).collect();

    let add = ranked
        .iter()
        .filter(|c| target.contains(c.id.as_str()) && !old_ids.contains(c.id.as_str()))
        .cloned()
        .collect();
    let remove = ranked
        .iter()
        .rev()
        .filter(|c| old_ids.contains(c.id.as_str()) && !target.contains(c.id.as_str()))
        .cloned()
        .collect();
    Selection { add, remove }
}

/// Declarative form of a strategy, as written in step catalogs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategySpec {
    KeepBestN { n: usize },
    KeepBestConstantSize,
    /// Subgroup made of the candidates of the listed algorithms.
    KeepBestNFromSubgroup { n: usize, algos: Vec<Algo> },
}

impl StrategySpec {
    pub fn build(&self, sort: SortMetric) -> Box<dyn SelectionStrategy> {
        match self {
            StrategySpec::KeepBestN { n } => Box::new(KeepBestN::new(*n, sort)),
            StrategySpec::KeepBestConstantSize => Box::new(KeepBestConstantSize::new(sort)),
            StrategySpec::KeepBestNFromSubgroup { n, algos } => {
                let algos = algos.clone();
                Box::new(KeepBestNFromSubgroup::new(*n, sort, move |c| {
                    algos.contains(&c.algo)
                }))
            }
        }
    }
}
