use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutoMlError {
    /// Caller error: unknown provider, duplicate allocation, malformed plan.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Mutation attempted on a structure that no longer allows it.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Aborting run after {count} consecutive model failures (last: {last})")]
    TooManyFailures { count: usize, last: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, AutoMlError>;

/// Why a training job produced no candidates.
///
/// Never escapes a step: the step still completes, with zero candidates.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum TrainError {
    /// The learning backend failed to fit the model.
    #[error("training failed: {0}")]
    Failed(String),
    /// The job was stopped before producing a model.
    #[error("training cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = AutoMlError::InvalidArgument("unknown provider 'Foo'".into());
        assert_eq!(e.to_string(), "Invalid argument: unknown provider 'Foo'");

        let e = AutoMlError::TooManyFailures {
            count: 3,
            last: "GBM:def_1".into(),
        };
        assert_eq!(
            e.to_string(),
            "Aborting run after 3 consecutive model failures (last: GBM:def_1)"
        );
    }

    #[test]
    fn train_error_display() {
        assert_eq!(
            TrainError::Failed("singular matrix".into()).to_string(),
            "training failed: singular matrix"
        );
        assert_eq!(TrainError::Cancelled.to_string(), "training cancelled");
    }
}
