use crate::GroupKey;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while configuring, running or rendering a profile.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The run settings are out of range or could not be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A file filter pattern is not a valid glob.
    #[error("invalid file pattern: {0}")]
    InvalidPattern(#[from] globset::Error),

    /// A tracer session was requested while the tracer was already recording.
    #[error("the allocation tracer is already started")]
    TracerAlreadyStarted,

    /// Two snapshot views grouped by different keys cannot be compared.
    #[error("cannot compare snapshots grouped by {earlier} with snapshots grouped by {later}")]
    GroupKeyMismatch { earlier: GroupKey, later: GroupKey },

    /// The profiled function returned an error.
    #[error("target function failed: {0}")]
    Target(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to serialize report: {0}")]
    Serialization(#[from] serde_json::Error),
}
