//! Socket ownership for both channels
//!
//! - The reliable stream channel (client↔server) is split in two: a
//!   [`ReliableSender`] that serialises whole messages onto the write half
//!   under a per-connection lock, and [`run_stream_reader`] which polls the
//!   read half and feeds a [`FrameDecoder`].
//! - The unreliable datagram channel (peer↔peer) is a [`DatagramChannel`]
//!   around one UDP socket. All peers share the receiving socket, so
//!   [`SourceDecoders`] keeps one decoder per source that has an incomplete
//!   frame buffered.
//!
//! Reads wait at most [`POLL_INTERVAL`] before re-checking [`KeepRunning`],
//! so clearing the flag stops every worker within one interval.

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::error::{ProtocolError, TransportError};
use crate::framing::FrameDecoder;
use crate::message::Message;

/// Bytes requested from the socket per read
pub const RECV_CHUNK_SIZE: usize = 2048;
/// Upper bound on any blocking wait before the shutdown flag is re-checked
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Share of unreliable sends that actually leave the socket
pub const DEFAULT_DELIVERY_PROBABILITY: f64 = 0.75;

/// Process-wide "keep running" flag shared by every worker
#[derive(Debug, Clone)]
pub struct KeepRunning(Arc<AtomicBool>);

impl Default for KeepRunning {
    fn default() -> Self {
        Self::new()
    }
}

impl KeepRunning {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What a receive worker observed on its socket
#[derive(Debug)]
pub enum ConnectionEvent {
    Message(Message),
    Malformed(ProtocolError),
    Closed,
}

/// Write side of a reliable connection.
///
/// The writer sits behind an async mutex held for the whole message, so
/// concurrent senders never interleave partial writes of two messages.
pub struct ReliableSender<W> {
    peer: SocketAddr,
    writer: Mutex<W>,
    alive: AtomicBool,
}

pub type TcpSender = ReliableSender<OwnedWriteHalf>;

impl<W> std::fmt::Debug for ReliableSender<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableSender")
            .field("peer", &self.peer)
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .finish()
    }
}

impl<W: AsyncWrite + Unpin + Send> ReliableSender<W> {
    pub fn new(peer: SocketAddr, writer: W) -> Self {
        Self {
            peer,
            writer: Mutex::new(writer),
            alive: AtomicBool::new(true),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Writes the whole encoded message, retrying partial writes.
    ///
    /// A zero-byte write or an I/O error marks the connection dead and every
    /// later send fails fast with [`TransportError::ConnectionDead`].
    pub async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::ConnectionDead);
        }

        let bytes = message.encode()?;
        let mut writer = self.writer.lock().await;
        let mut written = 0;

        while written < bytes.len() {
            if !self.is_alive() {
                return Err(TransportError::ConnectionDead);
            }
            match writer.write(&bytes[written..]).await {
                Ok(0) => {
                    self.mark_dead();
                    return Err(TransportError::ZeroWrite);
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.mark_dead();
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = writer.flush().await {
            self.mark_dead();
            return Err(e.into());
        }
        Ok(())
    }

    /// Marks the connection dead and closes the write half
    pub async fn shutdown(&self) {
        self.mark_dead();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of connection to {} failed: {}", self.peer, e);
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

/// Receive loop for the read half of a reliable connection.
///
/// Emits every decoded frame, reports undecodable frames as
/// [`ConnectionEvent::Malformed`], and finishes with
/// [`ConnectionEvent::Closed`] when the peer closes or the socket fails.
/// Returns quietly once `keep_running` is cleared.
pub async fn run_stream_reader<R: AsyncRead + Unpin>(
    mut reader: R,
    keep_running: KeepRunning,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; RECV_CHUNK_SIZE];

    while keep_running.is_running() {
        let len = match timeout(POLL_INTERVAL, reader.read(&mut chunk)).await {
            Err(_) => continue,
            Ok(Ok(0)) => {
                let _ = events.send(ConnectionEvent::Closed);
                return;
            }
            Ok(Ok(len)) => len,
            Ok(Err(e)) => {
                warn!("Read failed: {}", e);
                let _ = events.send(ConnectionEvent::Closed);
                return;
            }
        };

        decoder.push(&chunk[..len]);
        for frame in decoder.frames() {
            let event = match frame {
                Ok(message) => ConnectionEvent::Message(message),
                Err(e) => ConnectionEvent::Malformed(e),
            };
            if events.send(event).is_err() {
                return;
            }
        }
    }
}

/// Drops a fixed share of outgoing datagrams to exercise the peer protocols
/// against loss
#[derive(Debug)]
pub struct LossSimulator {
    delivery_probability: f64,
    rng: std::sync::Mutex<StdRng>,
}

impl LossSimulator {
    pub fn new(delivery_probability: f64) -> Self {
        Self::with_rng(delivery_probability, StdRng::from_entropy())
    }

    pub fn seeded(delivery_probability: f64, seed: u64) -> Self {
        Self::with_rng(delivery_probability, StdRng::seed_from_u64(seed))
    }

    /// Never drops anything
    pub fn lossless() -> Self {
        Self::new(1.0)
    }

    fn with_rng(delivery_probability: f64, rng: StdRng) -> Self {
        let delivery_probability = if delivery_probability.is_nan() {
            1.0
        } else {
            delivery_probability.clamp(0.0, 1.0)
        };
        Self {
            delivery_probability,
            rng: std::sync::Mutex::new(rng),
        }
    }

    pub fn delivery_probability(&self) -> f64 {
        self.delivery_probability
    }

    pub fn should_deliver(&self) -> bool {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen_bool(self.delivery_probability)
    }
}

impl Default for LossSimulator {
    fn default() -> Self {
        Self::new(DEFAULT_DELIVERY_PROBABILITY)
    }
}

/// The peer-to-peer channel: one UDP socket shared by every peer
pub struct DatagramChannel {
    socket: Arc<UdpSocket>,
    loss: LossSimulator,
}

impl DatagramChannel {
    pub async fn bind(addr: impl ToSocketAddrs, loss: LossSimulator) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket, loss))
    }

    pub fn from_socket(socket: UdpSocket, loss: LossSimulator) -> Self {
        Self {
            socket: Arc::new(socket),
            loss,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle for [`run_datagram_reader`]
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Sends one message as one datagram
    pub async fn send_to(&self, message: &Message, addr: SocketAddr) -> Result<(), TransportError> {
        let bytes = message.encode()?;
        let sent = self.socket.send_to(&bytes, addr).await?;
        if sent == 0 {
            return Err(TransportError::ZeroWrite);
        }
        Ok(())
    }

    /// Like [`send_to`](Self::send_to) but silently drops the datagram with
    /// the simulator's loss probability. Returns whether it was sent.
    pub async fn send_unreliable(
        &self,
        message: &Message,
        addr: SocketAddr,
    ) -> Result<bool, TransportError> {
        if !self.loss.should_deliver() {
            debug!("Simulated loss of datagram to {}", addr);
            return Ok(false);
        }
        self.send_to(message, addr).await?;
        Ok(true)
    }
}

/// Most sources that may hold a partial frame at once
pub const MAX_PARTIAL_SOURCES: usize = 64;

/// One frame decoder per datagram source. A decoder is only kept while
/// its source has an incomplete frame buffered.
#[derive(Debug, Default)]
pub struct SourceDecoders {
    decoders: HashMap<SocketAddr, FrameDecoder>,
}

impl SourceDecoders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sources currently holding an incomplete frame
    pub fn pending(&self) -> usize {
        self.decoders.len()
    }

    /// Feeds a datagram from `addr` and returns every frame it completed
    pub fn push(
        &mut self,
        addr: SocketAddr,
        chunk: &[u8],
    ) -> Vec<Result<Message, ProtocolError>> {
        let mut decoder = self.decoders.remove(&addr).unwrap_or_default();
        decoder.push(chunk);
        let frames: Vec<_> = decoder.frames().collect();

        if !decoder.buffered().is_empty() {
            if self.decoders.len() < MAX_PARTIAL_SOURCES {
                self.decoders.insert(addr, decoder);
            } else {
                warn!("Too many partial datagram sources, dropping bytes from {}", addr);
            }
        }
        frames
    }
}

/// Receive loop for the datagram channel, tagging each event with its
/// source address
pub async fn run_datagram_reader(
    socket: Arc<UdpSocket>,
    keep_running: KeepRunning,
    events: mpsc::UnboundedSender<(SocketAddr, ConnectionEvent)>,
) {
    let mut decoders = SourceDecoders::new();
    let mut chunk = [0u8; RECV_CHUNK_SIZE];

    while keep_running.is_running() {
        let (len, addr) = match timeout(POLL_INTERVAL, socket.recv_from(&mut chunk)).await {
            Err(_) => continue,
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                // ICMP unreachable from a departed peer surfaces here
                debug!("Datagram receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        if len == 0 {
            continue;
        }

        for frame in decoders.push(addr, &chunk[..len]) {
            let event = match frame {
                Ok(message) => ConnectionEvent::Message(message),
                Err(e) => ConnectionEvent::Malformed(e),
            };
            if events.send((addr, event)).is_err() {
                return;
            }
        }
    }
}
