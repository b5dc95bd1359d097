//! Error types for arbor-router.

use arbor_tree::Rank;
use thiserror::Error;

/// Result type for arbor-router operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the routing layer.
///
/// Daemon deaths themselves are not errors - the repair machinery absorbs
/// them. What surfaces here are the conditions the job cannot continue
/// through: a dead root, a lost link toward the root, ancestry views that
/// cannot be reconciled, and protocol messages that fail to decode.
#[derive(Debug, Error)]
pub enum Error {
    /// A rank outside the daemon space was used where a live rank is required.
    #[error("rank {rank} is outside the daemon space of {n_daemons}")]
    InvalidRank { rank: Rank, n_daemons: u64 },

    /// The branching factor cannot express a tree.
    #[error("branching factor must be at least 2, got {0}")]
    InvalidRadix(u64),

    /// The root daemon was reported dead. There is no slot above it to
    /// promote into; the job is over.
    #[error("the root daemon failed; the routing tree cannot be repaired")]
    RootFailed,

    /// This daemon's link toward the root is gone. Every route out of this
    /// subtree runs through it, so this daemon cannot continue.
    #[error("connection toward the root daemon was lost")]
    RootLost,

    /// Two daemons' ancestor views disagree even after failure inference.
    /// Continuing would risk silently misrouting control traffic.
    #[error("ancestor chains cannot be reconciled: reported {reported:?}, derived {derived:?}")]
    InconsistentAncestry {
        reported: Vec<Rank>,
        derived: Vec<Rank>,
    },

    /// A routing-protocol message failed to encode or decode. The routing
    /// layer is load-bearing for all control traffic, so this is fatal.
    #[error("notice codec failure: {0}")]
    Codec(#[from] bincode::Error),
}
