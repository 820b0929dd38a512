//! Ranked, deduplicated view of trained candidates.
//!
//! A [`Leaderboard`] keeps its entries sorted by the configured
//! [`SortMetric`], breaking ties by insertion order. [`Leaderboards`] is the
//! explicit registry handing out named boards.

mod candidate;
mod metric;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::events::{EventLog, Stage};

pub use candidate::Candidate;
pub use metric::{Direction, PolarityTable, SortMetric, Task, default_metric_for};

#[derive(Debug, Clone)]
struct Entry {
    candidate: Candidate,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<Entry>,
    next_seq: u64,
}

/// One row of a leaderboard, for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardRow {
    pub rank: usize,
    pub id: String,
    pub algo: String,
    pub score: Option<f64>,
    pub source_step: Option<String>,
}

#[derive(Debug)]
pub struct Leaderboard {
    name: String,
    sort: Option<SortMetric>,
    inner: RwLock<Inner>,
    events: Option<Arc<EventLog>>,
}

impl Leaderboard {
    /// Without a sort metric, candidates keep their insertion order.
    pub fn new(name: impl Into<String>, sort: Option<SortMetric>) -> Self {
        Self {
            name: name.into(),
            sort,
            inner: RwLock::new(Inner::default()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventLog>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sort_metric(&self) -> Option<&SortMetric> {
        self.sort.as_ref()
    }

    /// Inserts candidates; a candidate whose id is already present replaces
    /// the old entry and keeps its original tie-break position.
    pub fn insert(&self, candidates: impl IntoIterator<Item = Candidate>) {
        let mut inner = self.inner.write();
        let old_leader = inner.entries.first().map(|e| e.candidate.id.clone());
        for candidate in candidates {
            if let Some(entry) = inner
                .entries
                .iter_mut()
                .find(|e| e.candidate.id == candidate.id)
            {
                entry.candidate = candidate;
                continue;
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            if let Some(events) = &self.events {
                events.debug(
                    Stage::ModelTraining,
                    format!("Adding model {} to leaderboard {}", candidate.id, self.name),
                );
            }
            inner.entries.push(Entry { candidate, seq });
        }
        self.sort_entries(&mut inner.entries);
        self.report_leader_change(old_leader, &inner);
    }

    /// Removes candidates by id; absent ids are ignored.
    pub fn remove<S: AsRef<str>>(&self, ids: &[S]) {
        let mut inner = self.inner.write();
        let old_leader = inner.entries.first().map(|e| e.candidate.id.clone());
        inner
            .entries
            .retain(|e| !ids.iter().any(|id| id.as_ref() == e.candidate.id));
        self.report_leader_change(old_leader, &inner);
    }

    /// Candidates best-first.
    pub fn models(&self) -> Vec<Candidate> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|e| e.candidate.clone())
            .collect()
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|e| e.candidate.id.clone())
            .collect()
    }

    pub fn leader(&self) -> Option<Candidate> {
        self.inner.read().entries.first().map(|e| e.candidate.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().entries.iter().any(|e| e.candidate.id == id)
    }

    /// Zero-based rank of `id`, if present.
    pub fn rank_of(&self, id: &str) -> Option<usize> {
        self.inner
            .read()
            .entries
            .iter()
            .position(|e| e.candidate.id == id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn rows(&self) -> Vec<LeaderboardRow> {
        self.inner
            .read()
            .entries
            .iter()
            .enumerate()
            .map(|(rank, e)| LeaderboardRow {
                rank,
                id: e.candidate.id.clone(),
                algo: e.candidate.algo.to_string(),
                score: self.sort.as_ref().and_then(|s| e.candidate.metric(&s.name)),
                source_step: e.candidate.source_step.clone(),
            })
            .collect()
    }

    fn sort_entries(&self, entries: &mut [Entry]) {
        match &self.sort {
            Some(sort) => entries.sort_by(|a, b| {
                sort.compare(a.candidate.metric(&sort.name), b.candidate.metric(&sort.name))
                    .then(a.seq.cmp(&b.seq))
            }),
            None => entries.sort_by_key(|e| e.seq),
        }
    }

    fn report_leader_change(&self, old_leader: Option<String>, inner: &Inner) {
        let Some(leader) = inner.entries.first() else {
            return;
        };
        if old_leader.as_deref() == Some(leader.candidate.id.as_str()) {
            return;
        }
        if let Some(events) = &self.events {
            let score = match &self.sort {
                Some(sort) => format!(
                    ", {}: {}",
                    sort.name,
                    leader
                        .candidate
                        .metric(&sort.name)
                        .map_or_else(|| "n/a".to_string(), |v| v.to_string())
                ),
                None => String::new(),
            };
            events.info(
                Stage::ModelTraining,
                format!("New leader: {}{score}", leader.candidate.id),
            );
        }
    }
}

/// Registry of named leaderboards sharing one polarity table.
#[derive(Debug, Default)]
pub struct Leaderboards {
    polarity: PolarityTable,
    boards: Mutex<HashMap<String, Arc<Leaderboard>>>,
    events: Option<Arc<EventLog>>,
}

impl Leaderboards {
    pub fn new(polarity: PolarityTable) -> Self {
        Self {
            polarity,
            boards: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventLog>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn polarity(&self) -> &PolarityTable {
        &self.polarity
    }

    /// Returns the board called `name`, creating it sorted by `metric` if
    /// needed. An existing board keeps its original sort metric.
    pub fn get_or_make(&self, name: &str, metric: Option<&str>) -> Arc<Leaderboard> {
        let mut boards = self.boards.lock();
        let board = boards.entry(name.to_string()).or_insert_with(|| {
            let mut board = Leaderboard::new(name, metric.map(|m| self.polarity.sort_metric(m)));
            if let Some(events) = &self.events {
                board = board.with_events(Arc::clone(events));
            }
            Arc::new(board)
        });
        Arc::clone(board)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Leaderboard>> {
        self.boards.lock().get(name).cloned()
    }
}
