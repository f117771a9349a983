//! Multiplexed sessions and the streams they carry.
//!
//! A [`MuxSession`] wraps a [`RawMux`] (the stream multiplexer of a specific transport) and adds
//! the things every transport shares: stream accounting, per-stream encryption keyed from the
//! session's [`CipherContext`], idempotent close and round-trip pings.

use std::{
    fmt,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use snova_proto::{
    connect::{ConnectRequest, StreamRequest, PONG},
    message::write_message,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::{
    cipher::{CipherContext, Direction},
    codec::ChunkStream,
    error::{Error, Result},
};

pub mod quic;
pub mod yamux;

/// Any bidirectional byte stream that can be moved between tasks.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Which end of the multiplexer handshake a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// A stream as produced by the underlying multiplexer, before encryption.
pub struct RawStream {
    /// An id both ends of the session agree on.
    pub id: u64,
    pub io: BoxedStream,
}

/// The stream multiplexer of one transport.
#[async_trait]
pub trait RawMux: Send + Sync {
    async fn open(&self) -> Result<RawStream>;

    async fn accept(&self) -> Result<RawStream>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub struct MuxSession {
    id: u64,
    raw: Box<dyn RawMux>,
    cipher: RwLock<CipherContext>,
    streams: Arc<AtomicUsize>,
    closed: AtomicBool,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl MuxSession {
    pub fn new<M: RawMux + 'static>(raw: M, cipher: CipherContext, local_addr: Option<SocketAddr>, remote_addr: Option<SocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            raw: Box::new(raw),
            cipher: RwLock::new(cipher),
            streams: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            local_addr,
            remote_addr,
        })
    }

    /// A process-unique id for this session.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub async fn open_stream(&self) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(Error::SessionShutdown);
        }

        let raw = self.raw.open().await?;
        Ok(self.wrap(raw, Direction::Outbound))
    }

    pub async fn accept_stream(&self) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(Error::SessionShutdown);
        }

        let raw = self.raw.accept().await?;
        Ok(self.wrap(raw, Direction::Inbound))
    }

    fn wrap(&self, raw: RawStream, direction: Direction) -> MuxStream {
        let (write_direction, read_direction) = match direction {
            Direction::Outbound => (Direction::Outbound, Direction::Inbound),
            Direction::Inbound => (Direction::Inbound, Direction::Outbound),
        };

        let context = self.cipher.read().clone();
        let io: BoxedStream = match (context.codec(raw.id, write_direction), context.codec(raw.id, read_direction)) {
            (Some(encoder), Some(decoder)) => Box::new(ChunkStream::new(raw.io, encoder, decoder)),
            _ => raw.io,
        };

        MuxStream {
            id: raw.id,
            session_id: self.id,
            io,
            _guard: StreamGuard::new(Arc::clone(&self.streams)),
        }
    }

    /// The amount of streams of this session that haven't been dropped yet.
    pub fn num_streams(&self) -> usize {
        self.streams.load(Ordering::Acquire)
    }

    /// Switches the cipher used by streams opened or accepted from now on.
    pub fn reset_cipher(&self, context: CipherContext) {
        debug!("Session {} switching cipher to {context:?}", self.id);
        *self.cipher.write() = context;
    }

    pub fn cipher(&self) -> CipherContext {
        self.cipher.read().clone()
    }

    /// Closes the session. Returns whether this call was the one that closed it, calling this on
    /// an already closed session does nothing.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        debug!("Closing session {} with {} live streams", self.id, self.num_streams());
        self.raw.close().await;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.raw.is_closed()
    }

    /// Measures the round-trip time of a ping stream.
    pub async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        let mut stream = self.open_stream().await?;
        write_message(&mut stream, &StreamRequest::Ping).await?;
        match stream.read_u8().await? {
            PONG => Ok(start.elapsed()),
            other => Err(Error::Protocol(format!("Unexpected ping reply byte {other}"))),
        }
    }
}

impl fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxSession")
            .field("id", &self.id)
            .field("streams", &self.num_streams())
            .field("closed", &self.is_closed())
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Counts a live stream for as long as it exists.
struct StreamGuard {
    counter: Arc<AtomicUsize>,
}

impl StreamGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One logical bidirectional stream inside a [`MuxSession`].
pub struct MuxStream {
    id: u64,
    session_id: u64,
    io: BoxedStream,
    _guard: StreamGuard,
}

impl MuxStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Asks the remote end to connect this stream to a target. Must be the first thing written.
    pub async fn connect(&mut self, request: ConnectRequest) -> io::Result<()> {
        write_message(self, &StreamRequest::Connect(request)).await
    }
}

impl fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MuxStream({}/{})", self.session_id, self.id)
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::yamux::yamux_session;
    use snova_proto::methods::CipherMethod;
    use tokio::io::AsyncWriteExt;

    fn session_pair(cipher: CipherContext) -> (Arc<MuxSession>, Arc<MuxSession>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client = yamux_session(a, SessionRole::Client, cipher.clone(), None, None);
        let server = yamux_session(b, SessionRole::Server, cipher, None, None);
        (client, server)
    }

    #[tokio::test]
    async fn test_stream_count_follows_drops() {
        let (client, server) = session_pair(CipherContext::none());

        let mut first = client.open_stream().await.unwrap();
        first.write_all(b"x").await.unwrap();
        let accepted = server.accept_stream().await.unwrap();
        assert_eq!(accepted.id(), first.id());

        let second = client.open_stream().await.unwrap();
        assert_eq!(client.num_streams(), 2);
        drop(first);
        assert_eq!(client.num_streams(), 1);
        drop(second);
        assert_eq!(client.num_streams(), 0);
        assert_eq!(server.num_streams(), 1);
    }

    #[tokio::test]
    async fn test_rekeyed_streams_agree() {
        let (client, server) = session_pair(CipherContext::bootstrap("k", false));
        let context = CipherContext::new(CipherMethod::Aes256Gcm, "k", 99);
        client.reset_cipher(context.clone());
        server.reset_cipher(context);

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"after rekey").await.unwrap();
        stream.flush().await.unwrap();

        let mut accepted = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 11];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"after rekey");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = session_pair(CipherContext::none());
        assert!(client.close().await);
        assert!(!client.close().await);
        assert!(client.is_closed());
        assert!(matches!(client.open_stream().await, Err(Error::SessionShutdown)));
    }
}
