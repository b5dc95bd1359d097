//! Arbor Transport
//!
//! The reliable point-to-point byte-stream boundary the routing layer sits
//! on. Peers are addressed by daemon rank, not by socket: the address book
//! and connection lifecycle live down here, and the layers above only ever
//! see two signals - "message arrived from rank R" and "connection to
//! rank R is gone".
//!
//! Two implementations:
//!
//! - [`TcpTransport`]: length-prefixed frames over TCP with a rank
//!   handshake, socket buffers configured via `socket2`, lazy
//!   connect-on-first-send with a bounded retry budget.
//! - [`MemoryMesh`]: an in-process hub wiring N endpoints together for
//!   tests and failure simulations; killing an endpoint severs its links
//!   and delivers `PeerLost` to the peers that held them.
//!
//! Delivery and connection teardown are asynchronous; sends are
//! fire-and-forget enqueues. Retries, backoff and framing are this
//! crate's problem - the routing layer never blocks on a remote reply.

mod memory;
mod tcp;
mod types;

pub use memory::{MemoryMesh, MemoryTransport};
pub use tcp::{TcpConfig, TcpTransport};
pub use types::{Rank, Tag, TransportEvent};

use bytes::Bytes;
use std::future::Future;

/// A rank-addressed reliable transport endpoint.
///
/// `send` resolves when the payload is queued, not when it is delivered;
/// an unreachable peer surfaces later as a
/// [`TransportEvent::PeerLost`] on the endpoint's event stream.
pub trait Transport: Send + Sync + 'static {
    /// The rank this endpoint speaks for.
    fn local_rank(&self) -> Rank;

    /// Queue `payload` for delivery to `dest`.
    fn send(
        &self,
        dest: Rank,
        tag: Tag,
        payload: Bytes,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}
