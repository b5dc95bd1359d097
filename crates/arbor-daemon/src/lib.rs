//! Arbor Daemon - the control-plane progress context.
//!
//! One task per daemon owns the [`Router`](arbor_router::Router) and is
//! the only thing that ever mutates it. Transport events (messages,
//! lost connections) and commands from other tasks are marshalled into
//! that single task through one queue, so the whole repair protocol runs
//! without locks and at most one repair pass executes at a time.
//!
//! # Event flow
//!
//! - A lost connection or an inbound failure notice triggers a repair
//!   pass. The pass yields recovery reports; for each, the daemon sends
//!   adoption notices to changed children, reports subtree failures up
//!   the (possibly new) lifeline, and tells registered dependents.
//! - The root turns fresh failures into a tree-wide `global` announcement
//!   instead of reporting upward; every daemon relays that announcement
//!   to its children.
//! - Adoption notices are reconciled against the local ancestry; any
//!   inferred failures go through the same repair pass, with all its
//!   side effects.
//!
//! Notice sends are fire-and-forget enqueues; nothing in the loop blocks
//! on a remote reply. Daemon deaths are absorbed; what terminates the
//! daemon is only the fatal taxonomy: a dead root, a lost link toward
//! the root, irreconcilable ancestry, or a corrupt protocol message.

mod config;
mod daemon;
mod error;

pub use config::DaemonConfig;
pub use daemon::{Command, Daemon, DaemonHandle};
pub use error::{Error, Result};

pub use arbor_router::{
    FaultScope, NextHop, Rank, RecoveryReport, RepairHook, RouterSnapshot, RANK_INVALID,
};
pub use arbor_transport::{Tag, Transport, TransportEvent};
