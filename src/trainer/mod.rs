//! Seam towards the learning backend.
//!
//! The scheduler never fits models itself: steps describe what they need as
//! a [`TrainRequest`] and a [`Trainer`] turns it into candidates.

pub mod simulated;
pub mod types;

use std::future::Future;
use std::pin::Pin;

use crate::error::TrainError;
use crate::leaderboard::Candidate;
use crate::work::Algo;

pub use simulated::SimulatedTrainer;
pub use types::{TrainMode, TrainRequest};

pub type TrainFuture = Pin<Box<dyn Future<Output = Result<Vec<Candidate>, TrainError>> + Send>>;

/// Trait for learning backends, enabling mock implementations in tests.
pub trait Trainer: Send + Sync {
    /// Whether `algo` can be trained at all in this process.
    fn is_available(&self, _algo: Algo) -> bool {
        true
    }

    fn train(&self, request: TrainRequest) -> TrainFuture;
}
