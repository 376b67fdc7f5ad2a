use thiserror::Error;

/// Rejected run configuration. Surfaced before anything is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("setting `{0}` must not be empty")]
    Empty(&'static str),

    #[error("time limit must be a positive, finite number of seconds (got {0})")]
    InvalidTimeLimit(String),

    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("unknown stop signal `{0}` (expected int, term or kill)")]
    UnknownSignal(String),

    #[error("environment variable {key} has invalid value {value:?}: expected an unsigned integer")]
    InvalidEnv { key: String, value: String },
}
