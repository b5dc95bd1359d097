//! TCP transport with length-prefixed framing and a rank handshake.
//!
//! Connections are opened lazily on first send and cached per rank. Each
//! accepted or dialed stream starts with an 8-byte rank handshake so both
//! ends know who they are talking to; after that, every frame is a u32
//! little-endian length followed by the frame body. A failed or closed
//! stream drops the cached connection and raises `PeerLost` once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::types::{decode_frame, encode_frame, Rank, Tag, TransportEvent, MAX_FRAME_LEN};
use crate::Transport;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// This daemon's rank.
    pub rank: Rank,
    /// Address to bind to.
    pub bind: SocketAddr,
    /// Rank-indexed peer address book, supplied by the launcher.
    pub peers: Vec<SocketAddr>,
    /// Send buffer size in bytes.
    pub sndbuf: usize,
    /// Receive buffer size in bytes.
    pub rcvbuf: usize,
    /// How many times to retry dialing a peer before giving up.
    pub max_retries: u32,
}

impl TcpConfig {
    /// Config with default buffers and retry budget.
    pub fn new(rank: Rank, bind: SocketAddr, peers: Vec<SocketAddr>) -> Self {
        Self {
            rank,
            bind,
            peers,
            sndbuf: 1024 * 1024,
            rcvbuf: 1024 * 1024,
            max_retries: 3,
        }
    }

    /// Override the socket buffer sizes.
    #[must_use]
    pub fn with_buffers(mut self, sndbuf: usize, rcvbuf: usize) -> Self {
        self.sndbuf = sndbuf;
        self.rcvbuf = rcvbuf;
        self
    }

    /// Override the dial retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

struct TcpInner {
    cfg: TcpConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Per-peer frame queues; presence means a live connection.
    conns: Mutex<HashMap<Rank, mpsc::UnboundedSender<Bytes>>>,
}

/// A TCP endpoint of the control-plane mesh.
pub struct TcpTransport {
    inner: Arc<TcpInner>,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind the listener and start accepting peers.
    pub async fn bind(
        cfg: TcpConfig,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let listener = configure_listener(cfg.bind, cfg.sndbuf, cfg.rcvbuf)?;
        let local_addr = listener.local_addr()?;
        let (events, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(TcpInner {
            cfg,
            events,
            conns: Mutex::new(HashMap::new()),
        });

        tracing::info!(
            rank = inner.cfg.rank,
            %local_addr,
            sndbuf = inner.cfg.sndbuf,
            rcvbuf = inner.cfg.rcvbuf,
            "TCP transport bound"
        );

        tokio::spawn(accept_loop(listener, inner.clone()));

        Ok((Self { inner, local_addr }, events_rx))
    }

    /// The address the listener actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drop all connections. Peers observe the closed streams and raise
    /// their own `PeerLost`.
    pub async fn close(&self) {
        self.inner.conns.lock().await.clear();
    }
}

impl Transport for TcpTransport {
    fn local_rank(&self) -> Rank {
        self.inner.cfg.rank
    }

    async fn send(&self, dest: Rank, tag: Tag, payload: Bytes) -> anyhow::Result<()> {
        let frame = encode_frame(self.inner.cfg.rank, tag, &payload);
        let tx = connection_to(&self.inner, dest).await?;
        if tx.send(frame).is_err() {
            // Writer went away between lookup and send; the reader task
            // raises PeerLost
            anyhow::bail!("connection to rank {dest} closed while sending");
        }
        Ok(())
    }
}

/// Build a listener with configured buffers, as the launcher expects.
fn configure_listener(
    addr: SocketAddr,
    sndbuf: usize,
    rcvbuf: usize,
) -> anyhow::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_send_buffer_size(sndbuf)?;
    socket.set_recv_buffer_size(rcvbuf)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// Accept inbound peers, handshake, and register their streams.
async fn accept_loop(listener: TcpListener, inner: Arc<TcpInner>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            let mut buf = [0u8; 8];
            match stream.read_exact(&mut buf).await {
                Ok(_) => {
                    let peer = Rank::from_le_bytes(buf);
                    trace!(peer, %addr, "accepted peer connection");
                    let mut conns = inner.conns.lock().await;
                    register_stream(&inner, &mut conns, peer, stream);
                }
                Err(err) => {
                    warn!(%addr, %err, "handshake failed on inbound connection");
                }
            }
        });
    }
}

/// Split a handshaken stream into reader and writer tasks and register
/// the writer under the peer's rank. Caller holds the connection lock.
fn register_stream(
    inner: &Arc<TcpInner>,
    conns: &mut HashMap<Rank, mpsc::UnboundedSender<Bytes>>,
    peer: Rank,
    stream: TcpStream,
) -> mpsc::UnboundedSender<Bytes> {
    let (rd, wr) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    conns.insert(peer, tx.clone());
    tokio::spawn(write_loop(rx, wr));
    tokio::spawn(read_loop(inner.clone(), peer, rd, tx.clone()));
    tx
}

/// Fetch the cached connection to a rank, dialing if necessary. The
/// connection lock is held across the dial so concurrent sends to the
/// same rank cannot race a second stream into existence.
async fn connection_to(
    inner: &Arc<TcpInner>,
    dest: Rank,
) -> anyhow::Result<mpsc::UnboundedSender<Bytes>> {
    let mut conns = inner.conns.lock().await;
    if let Some(tx) = conns.get(&dest) {
        return Ok(tx.clone());
    }

    let addr = *inner
        .cfg
        .peers
        .get(dest as usize)
        .with_context(|| format!("no address for rank {dest}"))?;

    let mut attempt = 0;
    let mut stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(err) if attempt < inner.cfg.max_retries => {
                attempt += 1;
                debug!(dest, %addr, attempt, %err, "dial failed, retrying");
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
            }
            Err(err) => {
                // The peer is unreachable; report the loss exactly as a
                // broken established connection would
                let _ = inner.events.send(TransportEvent::PeerLost(dest));
                return Err(err).with_context(|| format!("dialing rank {dest} at {addr}"));
            }
        }
    };

    stream
        .write_all(&inner.cfg.rank.to_le_bytes())
        .await
        .context("sending handshake")?;

    Ok(register_stream(inner, &mut conns, dest, stream))
}

/// Drain the frame queue onto the socket.
async fn write_loop(mut rx: mpsc::UnboundedReceiver<Bytes>, mut wr: OwnedWriteHalf) {
    while let Some(frame) = rx.recv().await {
        let len = (frame.len() as u32).to_le_bytes();
        if wr.write_all(&len).await.is_err() || wr.write_all(&frame).await.is_err() {
            // Reader side notices and reports the loss
            break;
        }
    }
}

/// Read frames until the stream dies, then report the peer lost - but
/// only if this stream is still the one registered for the peer, so a
/// replaced connection cannot raise a spurious loss.
async fn read_loop(
    inner: Arc<TcpInner>,
    peer: Rank,
    mut rd: OwnedReadHalf,
    my_tx: mpsc::UnboundedSender<Bytes>,
) {
    loop {
        let mut len_buf = [0u8; 4];
        if rd.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            warn!(peer, len, "oversized frame; dropping connection");
            break;
        }
        let mut body = BytesMut::zeroed(len);
        if rd.read_exact(&mut body).await.is_err() {
            break;
        }
        match decode_frame(body.freeze()) {
            Some((from, tag, payload)) => {
                let _ = inner
                    .events
                    .send(TransportEvent::Message { from, tag, payload });
            }
            None => {
                warn!(peer, "malformed frame; dropping connection");
                break;
            }
        }
    }

    let mut conns = inner.conns.lock().await;
    let still_registered = conns
        .get(&peer)
        .map(|tx| tx.same_channel(&my_tx))
        .unwrap_or(false);
    if still_registered {
        conns.remove(&peer);
        drop(conns);
        debug!(peer, "connection lost");
        let _ = inner.events.send(TransportEvent::PeerLost(peer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn bind_assigns_a_port() {
        let cfg = TcpConfig::new(0, loopback(), vec![]);
        let (transport, _rx) = TcpTransport::bind(cfg).await.unwrap();
        assert!(transport.local_addr().port() > 0);
        assert_eq!(transport.local_rank(), 0);
    }

    #[tokio::test]
    async fn frames_flow_between_endpoints() {
        let (t0, mut rx0) = TcpTransport::bind(TcpConfig::new(0, loopback(), vec![]))
            .await
            .unwrap();
        let peers = vec![t0.local_addr()];
        let (t1, _rx1) = TcpTransport::bind(TcpConfig::new(1, loopback(), peers))
            .await
            .unwrap();

        t1.send(0, Tag::DaemonDied, Bytes::from_static(b"notice"))
            .await
            .unwrap();

        match rx0.recv().await.unwrap() {
            TransportEvent::Message { from, tag, payload } => {
                assert_eq!(from, 1);
                assert_eq!(tag, Tag::DaemonDied);
                assert_eq!(&payload[..], b"notice");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn replies_reuse_the_accepted_stream() {
        let (t0, mut rx0) = TcpTransport::bind(TcpConfig::new(0, loopback(), vec![]))
            .await
            .unwrap();
        let peers = vec![t0.local_addr()];
        let (t1, mut rx1) = TcpTransport::bind(TcpConfig::new(1, loopback(), peers))
            .await
            .unwrap();

        t1.send(0, Tag::User(1), Bytes::from_static(b"ping"))
            .await
            .unwrap();
        let _ = rx0.recv().await.unwrap();

        // Rank 0 has no address book entry for 1; the reply must travel
        // over the accepted connection
        t0.send(1, Tag::User(2), Bytes::from_static(b"pong"))
            .await
            .unwrap();
        match rx1.recv().await.unwrap() {
            TransportEvent::Message { from, tag, payload } => {
                assert_eq!(from, 0);
                assert_eq!(tag, Tag::User(2));
                assert_eq!(&payload[..], b"pong");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_peer_raises_peer_lost() {
        let (t0, mut rx0) = TcpTransport::bind(TcpConfig::new(0, loopback(), vec![]))
            .await
            .unwrap();
        let peers = vec![t0.local_addr()];
        let (t1, _rx1) = TcpTransport::bind(TcpConfig::new(1, loopback(), peers))
            .await
            .unwrap();

        // Establish the link, then drop it from rank 1's side
        t1.send(0, Tag::User(0), Bytes::from_static(b"hi"))
            .await
            .unwrap();
        let _ = rx0.recv().await.unwrap();
        t1.close().await;

        match rx0.recv().await.unwrap() {
            TransportEvent::PeerLost(1) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dialing_a_dead_address_fails_and_reports() {
        // Bind and immediately free a port so the dial is refused
        let dead_addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let cfg = TcpConfig::new(1, loopback(), vec![dead_addr]).with_max_retries(1);
        let (t1, mut rx1) = TcpTransport::bind(cfg).await.unwrap();

        t1.send(0, Tag::User(0), Bytes::new()).await.unwrap_err();
        match rx1.recv().await.unwrap() {
            TransportEvent::PeerLost(0) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
