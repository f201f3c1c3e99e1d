//! TCP transport
//!
//! Frames are `magic (4) | length (u32 LE) | payload`. Each connection gets
//! a reader task that forwards payloads as [`TransportEvent`]s and a writer
//! task fed by an unbounded queue. An oversize frame is cut to
//! `max_message_size + 1` bytes and still delivered, so the decoder rejects
//! it and the sender is charged for it.

use super::{NameMessage, PeerId, Transport};
use crate::constants::NETWORK_MAGIC;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const FRAME_HEADER_LEN: usize = 8;

/// What the transport reports to the node
#[derive(Debug)]
pub enum TransportEvent {
    Connected(PeerId, SocketAddr),
    Message(PeerId, Vec<u8>),
    Disconnected(PeerId),
}

struct Connection {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

pub struct TcpTransport {
    connections: Mutex<HashMap<PeerId, Connection>>,
    next_id: AtomicU64,
    max_message_size: usize,
    max_peers: usize,
    events: mpsc::Sender<TransportEvent>,
}

impl TcpTransport {
    pub fn new(
        max_message_size: usize,
        max_peers: usize,
    ) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(1024);
        let transport = Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_message_size,
            max_peers,
            events,
        });
        (transport, rx)
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<PeerId, Connection>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn peer_count(&self) -> usize {
        self.connections().len()
    }

    /// Accept inbound connections on `addr`
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> io::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "listening for peers");
        let transport = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        if transport.peer_count() >= transport.max_peers {
                            debug!(%remote, "peer limit reached, refusing connection");
                            continue;
                        }
                        transport.attach(stream, remote).await;
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }))
    }

    /// Dial a peer
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> io::Result<PeerId> {
        let stream = TcpStream::connect(addr).await?;
        Ok(self.attach(stream, addr).await)
    }

    async fn attach(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) -> PeerId {
        let peer = PeerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _ = self.events.send(TransportEvent::Connected(peer, remote)).await;
        let (mut read_half, mut write_half) = stream.into_split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!(%peer, error = %e, "write failed");
                    break;
                }
            }
        });

        let transport = Arc::clone(self);
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half, transport.max_message_size).await {
                    Ok(Some(payload)) => {
                        if transport.events.send(TransportEvent::Message(peer, payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(%peer, error = %e, "read failed");
                        break;
                    }
                }
            }
            transport.connections().remove(&peer);
            let _ = transport.events.send(TransportEvent::Disconnected(peer)).await;
        });

        self.connections().insert(peer, Connection { outbound, reader });
        info!(%peer, %remote, "peer connected");
        peer
    }

    fn queue(&self, peer: PeerId, frame: Vec<u8>) {
        if let Some(conn) = self.connections().get(&peer) {
            let _ = conn.outbound.send(frame);
        }
    }
}

/// Wrap an encoded message in a frame
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    bytes.extend_from_slice(&NETWORK_MAGIC);
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Read one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_message_size: usize,
) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    if header[..4] != NETWORK_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad network magic"));
    }
    let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

    let kept = length.min(max_message_size.saturating_add(1));
    let mut payload = vec![0u8; kept];
    reader.read_exact(&mut payload).await?;
    if kept < length {
        let skipped = (length - kept) as u64;
        tokio::io::copy(&mut reader.take(skipped), &mut tokio::io::sink()).await?;
    }
    Ok(Some(payload))
}

/// Write one framed message
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&frame(payload)).await
}

impl Transport for TcpTransport {
    fn send(&self, peer: PeerId, message: NameMessage) {
        match message.encode() {
            Ok(payload) => self.queue(peer, frame(&payload)),
            Err(e) => warn!(%peer, error = %e, "failed to encode message"),
        }
    }

    fn broadcast(&self, message: NameMessage, excluding: Option<PeerId>) {
        let payload = match message.encode() {
            Ok(payload) => frame(&payload),
            Err(e) => {
                warn!(error = %e, "failed to encode broadcast");
                return;
            }
        };
        for (peer, conn) in self.connections().iter() {
            if Some(*peer) != excluding {
                let _ = conn.outbound.send(payload.clone());
            }
        }
    }

    fn disconnect(&self, peer: PeerId) {
        if let Some(conn) = self.connections().remove(&peer) {
            conn.reader.abort();
            info!(%peer, "peer disconnected");
        }
    }
}
