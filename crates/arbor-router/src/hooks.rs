//! Dependent notification hooks.
//!
//! Other control-plane subsystems - group broadcast, file movement, I/O
//! forwarding - hold per-peer state keyed by rank. They register here to
//! be told when ranks die or when this daemon's ancestors or children
//! move, so they can purge dead peers and re-resolve routes to promoted
//! ones. Hooks fire once per repair pass, in registration order, on the
//! progress context that owns the router.

use tracing::trace;

use crate::report::RecoveryReport;

/// A dependent's repair callback.
pub type RepairHook = Box<dyn FnMut(&RecoveryReport) + Send>;

/// Registry of dependents interested in repair outcomes.
#[derive(Default)]
pub struct RepairHooks {
    hooks: Vec<RepairHook>,
}

impl RepairHooks {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dependent. Dispatch order is registration order.
    pub fn register(&mut self, hook: RepairHook) {
        self.hooks.push(hook);
    }

    /// Number of registered dependents.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no dependents are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Tell every dependent about one repair pass.
    pub fn dispatch(&mut self, report: &RecoveryReport) {
        trace!(
            dependents = self.hooks.len(),
            failed = ?report.failed,
            scope = ?report.scope,
            "dispatching recovery report"
        );
        for hook in self.hooks.iter_mut() {
            hook(report);
        }
    }
}

impl std::fmt::Debug for RepairHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairHooks")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
