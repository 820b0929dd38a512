//! Budget-aware step scheduling and candidate selection for AutoML runs.
//!
//! A modeling plan is resolved by the [`registry`] into weighted steps, whose
//! work is tracked in a [`work::WorkLedger`]. The [`executor`] drives those
//! [`steps`] against a shared time and model budget and credits progress so
//! that a finished run always reports exactly 1.0. Trained candidates land
//! on a [`leaderboard`], and [`selection`] strategies decide which of them
//! survive refinement rounds. [`automl::AutoML`] ties it together.

pub mod automl;
pub mod config;
pub mod countdown;
pub mod error;
pub mod events;
pub mod executor;
pub mod leaderboard;
pub mod progress;
pub mod registry;
pub mod selection;
pub mod steps;
pub mod trainer;
pub mod work;
