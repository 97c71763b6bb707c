//! Reliable ordered message sessions over TCP
//!
//! Each frame on the wire is a big-endian `u32` length followed by that many
//! bytes. A [`Connection`] owns two background tasks: the reader pushes
//! complete frames into an inbound queue that [`Session::poll_received`]
//! drains without blocking, and the writer serializes outgoing frames in send
//! order. State transitions are reported through a [`StateCallback`] that is
//! captured when the connection or listener is created.

use crate::protocol::{encode, Message, ProtocolError};
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type ConnectionId = u64;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 1 << 20;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed(String),
}

/// Answer to a `Connecting` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

pub type StateCallback = Arc<dyn Fn(ConnectionId, &ConnectionState) -> Verdict + Send + Sync>;

/// Callback that accepts every connection and ignores all other transitions.
pub fn accept_all() -> StateCallback {
    Arc::new(|_, _| Verdict::Accept)
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("Connection attempt rejected")]
    Rejected,

    #[error("Connection {0} is closed")]
    Closed(ConnectionId),

    #[error("Frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One reliable, ordered, message-based connection.
pub trait Session: Send {
    fn id(&self) -> ConnectionId;

    /// Queues a message for delivery. Fails if the session is closed.
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Drains every buffered inbound message; empty if none arrived.
    fn poll_received(&mut self) -> Vec<Vec<u8>>;

    fn is_open(&self) -> bool;

    /// Flushes pending output and closes the session.
    fn close(&self, reason: &str);

    fn send_message(&self, message: &Message) -> Result<(), TransportError> {
        self.send(encode(message)?)
    }
}

struct SharedState {
    id: ConnectionId,
    open: AtomicBool,
    callback: StateCallback,
}

impl SharedState {
    /// Marks the connection closed, notifying the callback only once.
    fn mark_closed(&self, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("Connection {} closed: {}", self.id, reason);
            (self.callback)(self.id, &ConnectionState::Closed(reason.to_string()));
        }
    }
}

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// Cloneable sending half of a [`Connection`].
#[derive(Clone)]
pub struct ConnectionSender {
    shared: Arc<SharedState>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionSender {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed(self.id()));
        }
        if bytes.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(bytes.len()));
        }
        self.outbound
            .send(Outbound::Frame(bytes))
            .map_err(|_| TransportError::Closed(self.id()))
    }

    pub fn send_message(&self, message: &Message) -> Result<(), TransportError> {
        self.send(encode(message)?)
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Frames queued before this call are still written before the socket shuts down.
    pub fn close(&self, reason: &str) {
        self.shared.mark_closed(reason);
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// TCP-backed [`Session`].
pub struct Connection {
    sender: ConnectionSender,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    peer: SocketAddr,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Opens an outbound connection.
    ///
    /// The callback sees `Connecting` first and may reject the attempt.
    pub async fn connect(
        addr: impl ToSocketAddrs + std::fmt::Display,
        callback: StateCallback,
    ) -> Result<Connection, TransportError> {
        let id = next_connection_id();
        if callback(id, &ConnectionState::Connecting) == Verdict::Reject {
            callback(id, &ConnectionState::Closed("rejected".to_string()));
            return Err(TransportError::Rejected);
        }

        let label = addr.to_string();
        match TcpStream::connect(addr).await {
            Ok(stream) => Self::start(id, stream, callback).map_err(|source| {
                TransportError::Connect {
                    addr: label,
                    source,
                }
            }),
            Err(source) => {
                callback(id, &ConnectionState::Closed(source.to_string()));
                Err(TransportError::Connect {
                    addr: label,
                    source,
                })
            }
        }
    }

    fn start(
        id: ConnectionId,
        stream: TcpStream,
        callback: StateCallback,
    ) -> io::Result<Connection> {
        let peer = match stream.peer_addr().and_then(|peer| {
            stream.set_nodelay(true)?;
            Ok(peer)
        }) {
            Ok(peer) => peer,
            Err(e) => {
                callback(id, &ConnectionState::Closed(e.to_string()));
                return Err(e);
            }
        };

        let shared = Arc::new(SharedState {
            id,
            open: AtomicBool::new(true),
            callback,
        });
        (shared.callback)(id, &ConnectionState::Connected);
        info!("Connection {} established with {}", id, peer);

        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(write_half, outbound_rx, Arc::clone(&shared)));
        let reader = tokio::spawn(read_loop(read_half, inbound_tx, Arc::clone(&shared)));

        Ok(Connection {
            sender: ConnectionSender {
                shared,
                outbound: outbound_tx,
            },
            inbound: inbound_rx,
            peer,
            reader,
        })
    }

    pub fn sender(&self) -> ConnectionSender {
        self.sender.clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Waits for the next inbound message. Returns `None` once the
    /// connection is closed and every buffered message has been consumed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }
}

impl Session for Connection {
    fn id(&self) -> ConnectionId {
        self.sender.id()
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.sender.send(bytes)
    }

    fn poll_received(&mut self) -> Vec<Vec<u8>> {
        let mut received = Vec::new();
        while let Ok(bytes) = self.inbound.try_recv() {
            received.push(bytes);
        }
        received
    }

    fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    fn close(&self, reason: &str) {
        self.sender.close(reason);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.sender.close("connection dropped");
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<SharedState>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if inbound.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => {
                shared.mark_closed("closed by peer");
                break;
            }
            Err(e) => {
                warn!("Connection {} read failed: {}", shared.id, e);
                shared.mark_closed(&e.to_string());
                break;
            }
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<SharedState>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(bytes) => {
                if let Err(e) = write_frame(&mut writer, &bytes).await {
                    warn!("Connection {} write failed: {}", shared.id, e);
                    shared.mark_closed(&e.to_string());
                    return;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

/// Reads one frame; `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    let mut frame = Vec::with_capacity(4 + bytes.len());
    frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(bytes);
    writer.write_all(&frame).await
}

/// Accepts inbound TCP sessions.
pub struct Listener {
    inner: TcpListener,
    callback: StateCallback,
}

impl Listener {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        callback: StateCallback,
    ) -> Result<Listener, TransportError> {
        let inner = TcpListener::bind(addr).await.map_err(TransportError::Bind)?;
        Ok(Listener { inner, callback })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.inner.local_addr().map_err(TransportError::Bind)
    }

    /// Waits for the next accepted connection.
    ///
    /// Attempts the callback rejects are dropped and the wait continues.
    pub async fn accept(&self) -> Result<Connection, TransportError> {
        loop {
            let (stream, addr) = self.inner.accept().await.map_err(TransportError::Accept)?;
            let id = next_connection_id();

            if (self.callback)(id, &ConnectionState::Connecting) == Verdict::Reject {
                info!("Rejected connection {} from {}", id, addr);
                (self.callback)(id, &ConnectionState::Closed("rejected".to_string()));
                continue;
            }

            match Connection::start(id, stream, Arc::clone(&self.callback)) {
                Ok(connection) => return Ok(connection),
                Err(e) => warn!("Dropping connection from {}: {}", addr, e),
            }
        }
    }
}

/// In-process [`Session`] used to drive servers and clients without sockets.
pub struct MemorySession {
    id: ConnectionId,
    open: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Two connected in-memory sessions. Closing either end closes both.
pub fn channel_pair() -> (MemorySession, MemorySession) {
    let open = Arc::new(AtomicBool::new(true));
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let a = MemorySession {
        id: next_connection_id(),
        open: Arc::clone(&open),
        outbound: a_tx,
        inbound: b_rx,
    };
    let b = MemorySession {
        id: next_connection_id(),
        open,
        outbound: b_tx,
        inbound: a_rx,
    };
    (a, b)
}

impl Session for MemorySession {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed(self.id));
        }
        self.outbound
            .send(bytes)
            .map_err(|_| TransportError::Closed(self.id))
    }

    fn poll_received(&mut self) -> Vec<Vec<u8>> {
        let mut received = Vec::new();
        while let Ok(bytes) = self.inbound.try_recv() {
            received.push(bytes);
        }
        received
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self, _reason: &str) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vector2;
    use crate::protocol::decode;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    type Transitions = Arc<Mutex<Vec<(ConnectionId, ConnectionState)>>>;

    fn recording_callback(verdict: Verdict) -> (StateCallback, Transitions) {
        let transitions: Transitions = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&transitions);
        let callback: StateCallback = Arc::new(move |id, state| {
            log.lock().unwrap().push((id, state.clone()));
            verdict
        });
        (callback, transitions)
    }

    async fn connected_pair() -> (Connection, Connection) {
        let listener = Listener::bind("127.0.0.1:0", accept_all()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(Connection::connect(addr, accept_all()), listener.accept());
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn test_frame_codec() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"hello").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (client, mut server) = connected_pair().await;

        for i in 0..50 {
            client
                .send_message(&Message::coords(i, Vector2::new(i as f32, 0.0)))
                .unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 50 {
            let bytes = timeout(Duration::from_secs(2), server.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(decode(&bytes).unwrap());
        }

        for (i, message) in received.iter().enumerate() {
            assert_eq!(*message, Message::coords(i as u32, Vector2::new(i as f32, 0.0)));
        }
    }

    #[tokio::test]
    async fn test_poll_received_is_non_blocking() {
        let (client, mut server) = connected_pair().await;
        assert!(server.poll_received().is_empty());

        client.send(b"ping".to_vec()).unwrap();
        let mut polled = Vec::new();
        for _ in 0..100 {
            polled.extend(server.poll_received());
            if !polled.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(polled, vec![b"ping".to_vec()]);
    }

    #[tokio::test]
    async fn test_close_flushes_then_reports_once() {
        let (callback, transitions) = recording_callback(Verdict::Accept);
        let listener = Listener::bind("127.0.0.1:0", accept_all()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(Connection::connect(addr, callback), listener.accept());
        let client = client.unwrap();
        let mut server = server.unwrap();

        client.send(b"last words".to_vec()).unwrap();
        client.close("done");
        client.close("again");

        assert!(!client.is_open());
        assert!(matches!(
            client.send(b"late".to_vec()),
            Err(TransportError::Closed(_))
        ));

        let bytes = timeout(Duration::from_secs(2), server.recv()).await.unwrap();
        assert_eq!(bytes, Some(b"last words".to_vec()));
        let end = timeout(Duration::from_secs(2), server.recv()).await.unwrap();
        assert_eq!(end, None);

        let states: Vec<ConnectionState> = transitions
            .lock()
            .unwrap()
            .iter()
            .map(|(_, state)| state.clone())
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Closed("done".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_peer_close_fires_callback() {
        let (callback, transitions) = recording_callback(Verdict::Accept);
        let listener = Listener::bind("127.0.0.1:0", callback).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(Connection::connect(addr, accept_all()), listener.accept());
        let server = server.unwrap();

        drop(client);

        for _ in 0..100 {
            if !server.is_open() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!server.is_open());
        let last = transitions.lock().unwrap().last().cloned();
        assert!(matches!(last, Some((id, ConnectionState::Closed(_))) if id == server.id()));
    }

    #[tokio::test]
    async fn test_outbound_reject() {
        let (callback, transitions) = recording_callback(Verdict::Reject);
        let result = Connection::connect("127.0.0.1:9", callback).await;

        assert!(matches!(result, Err(TransportError::Rejected)));
        let states: Vec<ConnectionState> = transitions
            .lock()
            .unwrap()
            .iter()
            .map(|(_, state)| state.clone())
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Closed("rejected".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_reports_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (callback, transitions) = recording_callback(Verdict::Accept);
        let result = Connection::connect(addr, callback).await;

        assert!(matches!(result, Err(TransportError::Connect { .. })));
        let last = transitions.lock().unwrap().last().cloned();
        assert!(matches!(last, Some((_, ConnectionState::Closed(_)))));
    }

    #[test]
    fn test_memory_session_pair() {
        let (a, mut b) = channel_pair();
        a.send(b"one".to_vec()).unwrap();
        a.send(b"two".to_vec()).unwrap();

        assert_eq!(b.poll_received(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(b.poll_received().is_empty());

        b.close("bye");
        assert!(!a.is_open());
        assert!(matches!(a.send(Vec::new()), Err(TransportError::Closed(_))));
    }
}
