//! Wire messages owned by the routing layer.
//!
//! Two messages, both tiny: the failure notice that flows up the tree (or
//! tree-wide from the root), and the adoption notice a repaired daemon
//! sends to its changed children. A notice that fails to decode is fatal
//! to the job - the routing layer carries every other control exchange, so
//! a corrupted protocol message cannot be shrugged off.

use arbor_tree::Rank;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// "These ranks are dead." Sent point-to-point to one's parent, or
/// broadcast tree-wide by the root with `global` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNotice {
    /// True when the root has announced these failures to the whole tree.
    pub global: bool,
    /// The dead ranks.
    pub failed: Vec<Rank>,
}

impl FailureNotice {
    /// A local (not yet root-acknowledged) notice.
    pub fn local(failed: Vec<Rank>) -> Self {
        Self {
            global: false,
            failed,
        }
    }

    /// A root-announced, tree-wide notice.
    pub fn global(failed: Vec<Rank>) -> Self {
        Self {
            global: true,
            failed,
        }
    }

    /// Serialize for the transport.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from the transport.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// "This is my ancestor chain now." Sent to each child whose slot changed
/// after a repair; the sender's own rank is the last entry, so the list is
/// exactly the receiver's new ancestry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdoptionNotice {
    /// The sender's post-repair chain, root-first, sender last.
    pub ancestors: Vec<Rank>,
}

impl AdoptionNotice {
    /// Build a notice from a chain and the sending rank.
    pub fn new(mut ancestors: Vec<Rank>, sender: Rank) -> Self {
        ancestors.push(sender);
        Self { ancestors }
    }

    /// Serialize for the transport.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from the transport.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
