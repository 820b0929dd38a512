//! Work ledger: the unit of budget accounting.
//!
//! Each planned step owns one [`Work`] entry whose weight is its share of the
//! whole run. The ledger is filled and adjusted during planning, then frozen;
//! after that, the only mutation left is [`Work::consume`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{AutoMlError, Result};

/// Learning algorithm family a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Algo {
    #[serde(rename = "GLM")]
    Glm,
    #[serde(rename = "DRF")]
    Drf,
    #[serde(rename = "GBM")]
    Gbm,
    #[serde(rename = "XGBoost")]
    XGBoost,
    DeepLearning,
    StackedEnsemble,
    /// Steps that only delegate to sub-steps chosen at run time.
    Virtual,
}

impl Algo {
    pub const ALL: [Algo; 7] = [
        Algo::Glm,
        Algo::Drf,
        Algo::Gbm,
        Algo::XGBoost,
        Algo::DeepLearning,
        Algo::StackedEnsemble,
        Algo::Virtual,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Algo::Glm => "GLM",
            Algo::Drf => "DRF",
            Algo::Gbm => "GBM",
            Algo::XGBoost => "XGBoost",
            Algo::DeepLearning => "DeepLearning",
            Algo::StackedEnsemble => "StackedEnsemble",
            Algo::Virtual => "virtual",
        }
    }
}

impl fmt::Display for Algo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algo {
    type Err = AutoMlError;

    fn from_str(s: &str) -> Result<Self> {
        Algo::ALL
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| AutoMlError::InvalidArgument(format!("unknown algo '{s}'")))
    }
}

/// What kind of job a unit of work stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    ModelBuild,
    HyperparamSearch,
    Selection,
    Dynamic,
}

impl JobType {
    /// Work that adds new candidates to the leaderboard.
    pub fn is_exploration(&self) -> bool {
        matches!(self, JobType::ModelBuild | JobType::HyperparamSearch)
    }

    /// Work that refines or replaces existing candidates.
    pub fn is_exploitation(&self) -> bool {
        matches!(self, JobType::Selection)
    }
}

/// One weighted unit of work, identified by `(id, provider)`.
#[derive(Debug)]
pub struct Work {
    pub id: String,
    pub provider: String,
    pub algo: Algo,
    pub job_type: JobType,
    pub priority_group: u32,
    weight: AtomicU32,
    consumed: AtomicBool,
}

impl Work {
    pub fn new(
        id: impl Into<String>,
        provider: impl Into<String>,
        algo: Algo,
        job_type: JobType,
        priority_group: u32,
        weight: u32,
    ) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            algo,
            job_type,
            priority_group,
            weight: AtomicU32::new(weight),
            consumed: AtomicBool::new(false),
        }
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Acquire)
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }

    /// Zeroes the weight and returns what it was.
    ///
    /// Only the first call returns a non-zero amount, so callers crediting
    /// progress with the returned value never credit the same work twice.
    pub fn consume(&self) -> u32 {
        self.consumed.store(true, Ordering::Release);
        self.weight.swap(0, Ordering::AcqRel)
    }

    fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Release);
    }
}

impl fmt::Display for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {:?} group={} weight={}{}",
            self.provider,
            self.id,
            self.job_type,
            self.priority_group,
            self.weight(),
            if self.is_consumed() { " (consumed)" } else { "" }
        )
    }
}

/// Ordered registry of [`Work`], mutable until frozen.
#[derive(Debug, Default)]
pub struct WorkLedger {
    items: RwLock<Vec<Arc<Work>>>,
    frozen: AtomicBool,
}

impl WorkLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Appends a work item. Fails once frozen, or if `(id, provider)` exists.
    pub fn allocate(&self, work: Work) -> Result<Arc<Work>> {
        self.ensure_mutable("allocate")?;
        let mut items = self.items.write();
        if items
            .iter()
            .any(|w| w.id == work.id && w.provider == work.provider)
        {
            return Err(AutoMlError::InvalidArgument(format!(
                "work '{}' already allocated for provider '{}'",
                work.id, work.provider
            )));
        }
        let work = Arc::new(work);
        items.push(Arc::clone(&work));
        Ok(work)
    }

    /// Makes the ledger immutable for allocation and removal. One-way.
    pub fn freeze(&self) -> &Self {
        self.frozen.store(true, Ordering::Release);
        self
    }

    /// Removes every item of `provider`, returning how many were removed.
    pub fn remove(&self, provider: &str) -> Result<usize> {
        self.ensure_mutable("remove")?;
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|w| w.provider != provider);
        Ok(before - items.len())
    }

    /// Multiplies the weight of every matching item by `factor`, rounding.
    pub fn rescale(&self, predicate: impl Fn(&Work) -> bool, factor: f64) -> Result<()> {
        self.ensure_mutable("rescale")?;
        for work in self.items.read().iter().filter(|w| predicate(w.as_ref())) {
            let scaled = (f64::from(work.weight()) * factor).round().max(0.0);
            work.set_weight(scaled as u32);
        }
        Ok(())
    }

    pub fn get(&self, id: &str, provider: &str) -> Option<Arc<Work>> {
        self.items
            .read()
            .iter()
            .find(|w| w.id == id && w.provider == provider)
            .cloned()
    }

    pub fn get_all(&self, predicate: impl Fn(&Work) -> bool) -> Vec<Arc<Work>> {
        self.items
            .read()
            .iter()
            .filter(|w| predicate(w.as_ref()))
            .cloned()
            .collect()
    }

    /// Sum of the weights of non-consumed items matching `predicate`.
    pub fn remaining_work(&self, predicate: Option<&dyn Fn(&Work) -> bool>) -> u64 {
        self.items
            .read()
            .iter()
            .filter(|w| !w.is_consumed())
            .filter(|w| predicate.is_none_or(|p| p(w.as_ref())))
            .map(|w| u64::from(w.weight()))
            .sum()
    }

    /// Share of the remaining matching work that `work` represents.
    pub fn remaining_work_ratio(
        &self,
        work: &Work,
        predicate: Option<&dyn Fn(&Work) -> bool>,
    ) -> f64 {
        let remaining = self.remaining_work(predicate);
        if remaining == 0 {
            return 0.0;
        }
        f64::from(work.weight()) / remaining as f64
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    fn ensure_mutable(&self, op: &str) -> Result<()> {
        if self.is_frozen() {
            return Err(AutoMlError::IllegalState(format!(
                "cannot {op} on a frozen work ledger"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for WorkLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items = self.items.read();
        write!(f, "WorkLedger{{")?;
        for (i, w) in items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{w}")?;
        }
        write!(f, "}}")
    }
}
