use thiserror::Error;

/// Error taxonomy shared by every component of the core (rule engine,
/// enforcer, resolver, attributor). IPC handlers and the CLI add
/// human-readable context with `anyhow` at the boundary; this enum is what
/// library code actually returns and matches on.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resolution failed for '{0}'")]
    ResolutionFailed(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("enforcer failed at step '{step}': {detail}")]
    EnforcerFailed { step: String, detail: String },

    #[error("rule not found")]
    NotFound,

    #[error("partial removal: {0}")]
    Partial(String),

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

impl WardenError {
    #[must_use]
    pub fn enforcer_failed(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::EnforcerFailed {
            step: step.into(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
