use std::time::Duration;

use crate::thresholds::ThresholdParseError;

/// Invalid run definition. Raised before any load is generated.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("`stages` must contain at least one stage")]
    NoStages,

    #[error("the stage plan has a total duration of zero")]
    ZeroDuration,

    #[error("scenario `{name}` is invalid: {reason}")]
    InvalidScenario { name: String, reason: String },

    #[error("scenario `{0}` is registered more than once")]
    DuplicateScenario(String),

    #[error("at least one scenario must be registered")]
    NoScenarios,

    #[error("scenario weights add up to a non-finite total")]
    TotalWeight,

    #[error("breakdown key `{0}` must be non-empty and free of `{{`, `}}`, `,` and `=`")]
    InvalidBreakdownKey(String),

    #[error("invalid threshold `{expression}` for metric `{metric}`: {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: ThresholdParseError,
    },

    #[error("invalid pacing: {0}")]
    InvalidPacing(String),

    #[error("`{0}` must be a positive duration")]
    ZeroInterval(&'static str),

    #[error(transparent)]
    Metrics(#[from] stampede_metrics::Error),
}

/// A setup hook did not complete; the run is not started.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SetupFailure {
    #[error("{hook} failed: {message}")]
    Hook { hook: String, message: String },

    #[error("setup did not finish within {0:?}")]
    Timeout(Duration),
}

impl SetupFailure {
    pub fn hook(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            hook: hook.into(),
            message: message.into(),
        }
    }
}
