use thiserror::Error;

/// Canonical sift error taxonomy used across crates.
///
/// Classification guidance:
/// - [`SiftError::Planning`]: malformed plan fragments handed to the coordinator
/// - [`SiftError::Execution`]: runtime failures while scheduling (split source errors)
/// - [`SiftError::InternalState`]: violated coordination invariants; never retried
/// - [`SiftError::ResourceUnavailable`]: no worker can take the work right now
/// - [`SiftError::InvalidConfig`]: config/environment contract violations
/// - [`SiftError::Io`]: raw IO failures from std APIs
#[derive(Debug, Error)]
pub enum SiftError {
    /// Invalid or inconsistent configuration.
    ///
    /// Examples:
    /// - zero split batch size
    /// - unparsable `SIFT_*` environment value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Plan-shape failures detected by the coordinator.
    #[error("planning error: {0}")]
    Planning(String),

    /// Runtime failures after planning succeeded.
    ///
    /// Examples:
    /// - connector split source failed to produce a batch
    /// - scheduling on an aborted stage
    #[error("execution error: {0}")]
    Execution(String),

    /// Coordination invariant violation.
    ///
    /// Examples:
    /// - a task reported two different domains for the same dynamic filter
    /// - two tasks reported different domains for a replicated filter
    #[error("internal state violation: {0}")]
    InternalState(String),

    /// No eligible worker node can accept work for a stage.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard sift result alias.
pub type Result<T> = std::result::Result<T, SiftError>;
