//! Error types for arbor-daemon.

use thiserror::Error;

/// Result type for arbor-daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Conditions that end a daemon.
///
/// A terminating daemon is this crate's forced-exit signal: the embedding
/// runtime observes the task's result and tears the job down.
#[derive(Debug, Error)]
pub enum Error {
    /// The routing layer hit a fatal condition: a dead root, a lost root
    /// link, irreconcilable ancestry, or a corrupt notice.
    #[error("routing failure: {0}")]
    Router(#[from] arbor_router::Error),

    /// A routed user payload failed to decode. Routed traffic shares the
    /// control links, so corruption here is just as fatal.
    #[error("routed payload codec failure: {0}")]
    Codec(#[from] bincode::Error),

    /// The daemon task is gone; commands have nowhere to go.
    #[error("daemon task has terminated")]
    Terminated,
}
