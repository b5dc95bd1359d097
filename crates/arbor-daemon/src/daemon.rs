//! The progress-context event loop.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use arbor_router::{
    AdoptionNotice, FailureNotice, FaultScope, NextHop, Rank, RecoveryReport, RepairHook,
    RepairHooks, Router, RouterSnapshot, RANK_INVALID,
};
use arbor_transport::{Tag, Transport, TransportEvent};

use crate::config::DaemonConfig;
use crate::error::{Error, Result};

/// User tag carrying routed (multi-hop) traffic.
const ROUTED_TAG: u16 = 0;

/// Multi-hop envelope for dependent traffic: each hop re-resolves the
/// next hop toward `dst` and forwards, so only the endpoints ever need to
/// know about each other.
#[derive(Debug, Serialize, Deserialize)]
struct RoutedEnvelope {
    src: Rank,
    dst: Rank,
    payload: Vec<u8>,
}

/// Commands marshalled into the owning task from elsewhere.
pub enum Command {
    /// Resolve one step toward a target.
    NextHop {
        target: Rank,
        reply: oneshot::Sender<NextHop>,
    },
    /// Copy out the current routing view.
    Snapshot {
        reply: oneshot::Sender<RouterSnapshot>,
    },
    /// Register a dependent's repair callback.
    RegisterHook(RepairHook),
    /// Send a routed payload toward a rank.
    SendRouted { dst: Rank, payload: Bytes },
    /// Enter deliberate shutdown and stop the loop.
    Shutdown,
}

/// Cloneable handle for talking to a running daemon.
#[derive(Clone)]
pub struct DaemonHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl DaemonHandle {
    /// Resolve one step toward `target` on the owning task.
    pub async fn next_hop(&self, target: Rank) -> Result<NextHop> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::NextHop { target, reply })
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)
    }

    /// Fetch the current routing view.
    pub async fn snapshot(&self) -> Result<RouterSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .map_err(|_| Error::Terminated)?;
        rx.await.map_err(|_| Error::Terminated)
    }

    /// Register a dependent to be told about repairs.
    pub fn register_hook(&self, hook: RepairHook) -> Result<()> {
        self.commands
            .send(Command::RegisterHook(hook))
            .map_err(|_| Error::Terminated)
    }

    /// Route a payload to `dst`, hop by hop through the tree.
    pub fn send_routed(&self, dst: Rank, payload: Bytes) -> Result<()> {
        self.commands
            .send(Command::SendRouted { dst, payload })
            .map_err(|_| Error::Terminated)
    }

    /// Ask the daemon to shut down cleanly.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// One daemon's progress context: the sole owner of its [`Router`].
pub struct Daemon<T: Transport> {
    router: Router,
    transport: T,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    hooks: RepairHooks,
    /// Routed payloads addressed to this daemon, handed to the embedder.
    delivered: mpsc::UnboundedSender<(Rank, Bytes)>,
}

impl<T: Transport> Daemon<T> {
    /// Build a daemon around a transport endpoint and its event stream.
    ///
    /// Returns the daemon (drive it with [`run`](Self::run)), the command
    /// handle, and the stream of routed payloads delivered to this rank.
    #[allow(clippy::type_complexity)]
    pub fn new(
        config: DaemonConfig,
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<(Self, DaemonHandle, mpsc::UnboundedReceiver<(Rank, Bytes)>)> {
        let router = Router::new(config.n_daemons, config.radix, config.rank)?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        debug!(
            rank = config.rank,
            n_daemons = config.n_daemons,
            radix = config.radix,
            "daemon starting"
        );
        Ok((
            Self {
                router,
                transport,
                events,
                commands: commands_rx,
                hooks: RepairHooks::new(),
                delivered: delivered_tx,
            },
            DaemonHandle {
                commands: commands_tx,
            },
            delivered_rx,
        ))
    }

    /// Convenience: build and spawn onto the current runtime.
    #[allow(clippy::type_complexity)]
    pub fn spawn(
        config: DaemonConfig,
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<(
        DaemonHandle,
        mpsc::UnboundedReceiver<(Rank, Bytes)>,
        JoinHandle<Result<()>>,
    )> {
        let (daemon, handle, delivered) = Self::new(config, transport, events)?;
        let join = tokio::spawn(daemon.run());
        Ok((handle, delivered, join))
    }

    /// Drive the event loop until shutdown or a fatal condition.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(TransportEvent::Message { from, tag, payload }) => {
                        self.on_message(from, tag, payload).await?;
                    }
                    Some(TransportEvent::PeerLost(rank)) => {
                        self.on_peer_lost(rank).await?;
                    }
                    None => {
                        debug!("transport event stream closed");
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::NextHop { target, reply }) => {
                        let _ = reply.send(self.router.next_hop(target));
                    }
                    Some(Command::Snapshot { reply }) => {
                        let _ = reply.send(self.router.snapshot());
                    }
                    Some(Command::RegisterHook(hook)) => {
                        self.hooks.register(hook);
                    }
                    Some(Command::SendRouted { dst, payload }) => {
                        let envelope = RoutedEnvelope {
                            src: self.router.my_rank(),
                            dst,
                            payload: payload.to_vec(),
                        };
                        self.forward(envelope).await?;
                    }
                    Some(Command::Shutdown) => {
                        debug!(rank = self.router.my_rank(), "shutting down");
                        self.router.begin_shutdown();
                        break;
                    }
                    None => break,
                },
            }
        }
        Ok(())
    }

    /// A direct connection died.
    async fn on_peer_lost(&mut self, rank: Rank) -> Result<()> {
        trace!(peer = rank, "connection lost");
        let reports = self.router.route_lost(rank)?;
        self.after_repair(&reports).await
    }

    /// A control message arrived.
    async fn on_message(&mut self, from: Rank, tag: Tag, payload: Bytes) -> Result<()> {
        trace!(from, ?tag, len = payload.len(), "control message");
        match tag {
            Tag::DaemonDied => {
                let notice = FailureNotice::decode(&payload)?;
                let scope = if notice.global {
                    FaultScope::Global
                } else {
                    FaultScope::Local
                };
                let reports = self.router.repair(&notice.failed, scope)?;
                self.after_repair(&reports).await?;
                if notice.global && !self.router.is_root() {
                    // Pass the root's announcement on down the tree
                    self.relay_global(&notice).await?;
                }
            }
            Tag::DaemonAdopted => {
                let notice = AdoptionNotice::decode(&payload)?;
                let inferred = self.router.reconcile_adoption(&notice.ancestors)?;
                if !inferred.is_empty() {
                    // Run the full pass so the inferred deaths propagate
                    // exactly like directly observed ones
                    let reports = self.router.repair(&inferred, FaultScope::Local)?;
                    self.after_repair(&reports).await?;
                }
            }
            Tag::User(ROUTED_TAG) => {
                let envelope: RoutedEnvelope = bincode::deserialize(&payload)?;
                self.forward(envelope).await?;
            }
            Tag::User(other) => {
                trace!(from, tag = other, "unclaimed user message dropped");
            }
        }
        Ok(())
    }

    /// Per-report propagation: notices first, then dependents - matching
    /// the order peers and local subsystems expect to learn in.
    async fn after_repair(&mut self, reports: &[RecoveryReport]) -> Result<()> {
        for report in reports {
            if report.scope == FaultScope::Local {
                self.send_adoption_notices(report).await?;
                self.send_failure_notice(report).await?;
            }
            self.hooks.dispatch(report);
        }
        Ok(())
    }

    /// Tell new or moved children what their ancestry looks like now.
    async fn send_adoption_notices(&mut self, report: &RecoveryReport) -> Result<()> {
        if !report.children_changed && !report.promoted {
            return Ok(());
        }

        let notice = AdoptionNotice::new(
            self.router.ancestors().to_vec(),
            self.router.my_rank(),
        );
        let payload = Bytes::from(notice.encode()?);

        let children = self.router.child_slots().to_vec();
        for (idx, &child) in children.iter().enumerate() {
            if child == RANK_INVALID {
                continue;
            }
            if !report.promoted && report.prev_children.get(idx) == Some(&child) {
                // This child neither moved nor is new
                continue;
            }
            debug!(child, "sending adoption notice");
            if let Err(err) = self
                .transport
                .send(child, Tag::DaemonAdopted, payload.clone())
                .await
            {
                // Delivery is the transport's problem; a dead child will
                // surface as PeerLost and repair from there
                warn!(child, %err, "adoption notice not delivered");
            }
        }
        Ok(())
    }

    /// Report fresh subtree failures up the lifeline, or - at the root -
    /// acknowledge them tree-wide.
    async fn send_failure_notice(&mut self, report: &RecoveryReport) -> Result<()> {
        let failed = if report.parent_changed {
            // A new parent may have missed everything the old one knew
            self.router.unacknowledged_subtree_failures()
        } else {
            self.router.subtree_failures(&report.failed)
        };
        if failed.is_empty() {
            return Ok(());
        }

        if self.router.is_root() {
            let notice = FailureNotice::global(failed);
            self.router.acknowledge_global(&notice.failed);
            debug!(failed = ?notice.failed, "announcing failures tree-wide");
            self.relay_global(&notice).await
        } else {
            let Some(parent) = self.router.parent() else {
                return Ok(());
            };
            let notice = FailureNotice::local(failed);
            let payload = Bytes::from(notice.encode()?);
            debug!(parent, failed = ?notice.failed, "reporting failures upward");
            if let Err(err) = self.transport.send(parent, Tag::DaemonDied, payload).await {
                warn!(parent, %err, "failure notice not delivered");
            }
            Ok(())
        }
    }

    /// Forward a global announcement to every child.
    async fn relay_global(&mut self, notice: &FailureNotice) -> Result<()> {
        let payload = Bytes::from(notice.encode()?);
        let children: Vec<Rank> = self.router.children().collect();
        for child in children {
            if let Err(err) = self
                .transport
                .send(child, Tag::DaemonDied, payload.clone())
                .await
            {
                warn!(child, %err, "global notice not relayed");
            }
        }
        Ok(())
    }

    /// Move a routed envelope one hop: deliver here, or send to the next
    /// rank toward its destination.
    async fn forward(&mut self, envelope: RoutedEnvelope) -> Result<()> {
        match self.router.next_hop(envelope.dst) {
            NextHop::Deliver => {
                trace!(src = envelope.src, "routed payload delivered");
                let _ = self
                    .delivered
                    .send((envelope.src, Bytes::from(envelope.payload)));
            }
            NextHop::Forward(hop) => {
                trace!(dst = envelope.dst, hop, "forwarding routed payload");
                let bytes = Bytes::from(bincode::serialize(&envelope)?);
                if let Err(err) = self.transport.send(hop, Tag::User(ROUTED_TAG), bytes).await {
                    warn!(hop, %err, "routed payload not forwarded");
                }
            }
            NextHop::Unreachable => {
                // Transient while a repair is in flight, permanent if the
                // destination is dead; either way the sender retries or
                // gives up above us
                warn!(dst = envelope.dst, "no route to destination; dropping");
            }
        }
        Ok(())
    }
}
