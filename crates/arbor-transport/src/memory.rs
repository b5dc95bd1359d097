//! In-process transport mesh for tests and failure simulation.
//!
//! Wires N endpoints through unbounded channels. Links are recorded as
//! traffic flows (or pre-established with [`MemoryMesh::link`], the way a
//! launcher warms up the tree's parent-child connections), and
//! [`MemoryMesh::kill`] severs an endpoint: its linked, still-living
//! peers each receive a `PeerLost` - exactly the signal a real transport
//! raises when a daemon dies.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::types::{Rank, Tag, TransportEvent};
use crate::Transport;

struct MeshInner {
    inboxes: Vec<mpsc::UnboundedSender<TransportEvent>>,
    alive: Vec<AtomicBool>,
    /// Normalized (low, high) pairs of ranks that hold a connection.
    links: Mutex<HashSet<(Rank, Rank)>>,
}

impl MeshInner {
    fn deliver(&self, to: Rank, event: TransportEvent) {
        if let Some(inbox) = self.inboxes.get(to as usize) {
            // A dropped receiver just means the endpoint is gone
            let _ = inbox.send(event);
        }
    }
}

fn link_key(a: Rank, b: Rank) -> (Rank, Rank) {
    (a.min(b), a.max(b))
}

/// The hub owning all endpoints of one simulated job.
#[derive(Clone)]
pub struct MemoryMesh {
    inner: Arc<MeshInner>,
}

impl MemoryMesh {
    /// Build a mesh of `n` endpoints. Returns the hub and one
    /// `(endpoint, event stream)` pair per rank, in rank order.
    pub fn new(n: u64) -> (Self, Vec<(MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>)>) {
        let mut inboxes = Vec::with_capacity(n as usize);
        let mut receivers = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let (tx, rx) = mpsc::unbounded_channel();
            inboxes.push(tx);
            receivers.push(rx);
        }
        let inner = Arc::new(MeshInner {
            inboxes,
            alive: (0..n).map(|_| AtomicBool::new(true)).collect(),
            links: Mutex::new(HashSet::new()),
        });
        let mesh = Self { inner };
        let endpoints = receivers
            .into_iter()
            .enumerate()
            .map(|(rank, rx)| {
                (
                    MemoryTransport {
                        rank: rank as Rank,
                        mesh: mesh.inner.clone(),
                    },
                    rx,
                )
            })
            .collect();
        (mesh, endpoints)
    }

    /// Pre-establish a connection between two ranks, as the launch
    /// sequence does for every tree edge before traffic flows.
    pub fn link(&self, a: Rank, b: Rank) {
        self.inner.links.lock().unwrap().insert(link_key(a, b));
    }

    /// Whether an endpoint is still up.
    pub fn is_alive(&self, rank: Rank) -> bool {
        self.inner
            .alive
            .get(rank as usize)
            .map(|a| a.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Kill an endpoint. Every living peer that held a link to it gets a
    /// `PeerLost` - the asynchronous "connection to rank R lost" signal.
    pub fn kill(&self, rank: Rank) {
        let Some(alive) = self.inner.alive.get(rank as usize) else {
            return;
        };
        if !alive.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(rank, "killing endpoint");

        let peers: Vec<Rank> = {
            let mut links = self.inner.links.lock().unwrap();
            let severed: Vec<(Rank, Rank)> = links
                .iter()
                .copied()
                .filter(|&(a, b)| a == rank || b == rank)
                .collect();
            for key in &severed {
                links.remove(key);
            }
            severed
                .into_iter()
                .map(|(a, b)| if a == rank { b } else { a })
                .collect()
        };

        for peer in peers {
            if self.is_alive(peer) {
                trace!(rank, peer, "signalling lost connection");
                self.inner.deliver(peer, TransportEvent::PeerLost(rank));
            }
        }
    }
}

/// One endpoint of a [`MemoryMesh`].
pub struct MemoryTransport {
    rank: Rank,
    mesh: Arc<MeshInner>,
}

impl Transport for MemoryTransport {
    fn local_rank(&self) -> Rank {
        self.rank
    }

    async fn send(&self, dest: Rank, tag: Tag, payload: Bytes) -> anyhow::Result<()> {
        if dest as usize >= self.mesh.inboxes.len() {
            anyhow::bail!("rank {dest} is outside this mesh");
        }
        if !self.mesh.alive[self.rank as usize].load(Ordering::SeqCst) {
            // A dead endpoint sends nothing
            return Ok(());
        }

        self.mesh
            .links
            .lock()
            .unwrap()
            .insert(link_key(self.rank, dest));

        if !self.mesh.alive[dest as usize].load(Ordering::SeqCst) {
            // Connection refused: the peer is already gone
            trace!(from = self.rank, dest, "send to dead peer");
            self.mesh
                .deliver(self.rank, TransportEvent::PeerLost(dest));
            return Ok(());
        }

        self.mesh.deliver(
            dest,
            TransportEvent::Message {
                from: self.rank,
                tag,
                payload,
            },
        );
        Ok(())
    }
}
