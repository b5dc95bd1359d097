//! Daemon startup configuration.

use arbor_router::Rank;

/// Process-startup parameters, read once before any routing call.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Total daemons in the job, supplied by the launcher.
    pub n_daemons: u64,
    /// This daemon's rank.
    pub rank: Rank,
    /// Branching factor of the routing tree.
    pub radix: u64,
    /// Send-retry budget handed to the transport. The routing layer
    /// itself never retries.
    pub max_retries: u32,
}

impl DaemonConfig {
    /// Defaults: radix 64, three send retries.
    pub fn new(n_daemons: u64, rank: Rank) -> Self {
        Self {
            n_daemons,
            rank,
            radix: 64,
            max_retries: 3,
        }
    }

    /// Override the branching factor.
    #[must_use]
    pub fn with_radix(mut self, radix: u64) -> Self {
        self.radix = radix;
        self
    }

    /// Override the transport's send-retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}
