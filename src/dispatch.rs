//! Serves the streams of accepted sessions.
//!
//! Every session starts with the auth exchange. Signaling sessions then keep repeating it, one
//! exchange per stream, while every other session moves on to dispatching: each stream carries a
//! [`StreamRequest`] that is either a ping or a request to connect somewhere. Connections go
//! straight to the target, through the next hop of a chain, or, for sessions in a peer-to-peer
//! room, to the other member of the room.
//!
//! Targets are dialed over TCP or UDP. A UDP target is relayed as a byte stream where every write
//! on the tunnel stream becomes one datagram.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
    time::Duration,
};

use futures_util::future::BoxFuture;

use snova_proto::{
    connect::{ConnectRequest, StreamRequest, PONG},
    message::read_message,
    methods::CompressMethod,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{lookup_host, TcpStream, UdpSocket},
    select,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    auth::ServerAuth,
    channel::Registry,
    compress,
    config::{CipherConfig, ProxyLimitConfig, ServerConfig},
    error::{Error, Result},
    mux::{BoxedStream, MuxSession, MuxStream},
    p2p::rooms::RoomTable,
    ratelimit::{TokenBucket, UserRateLimits},
    relay,
};

/// How long a new session may take to authenticate.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an accepted stream may take to say what it wants.
pub const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a session with an idle limit checks whether it's been left without streams.
pub const SESSION_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(10_000);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// What an authenticated session negotiated, shared by all of its streams.
struct StreamContext {
    compress: CompressMethod,
    /// Room token and connection id of a peer-to-peer data session.
    room: Option<(String, String)>,
    /// Paces the bytes relayed back to the session's user.
    limit: Option<Arc<TokenBucket>>,
}

/// A reached target, and whether it carries datagrams rather than a byte stream.
struct Target {
    io: BoxedStream,
    datagram: bool,
}

pub struct Dispatcher {
    registry: Weak<Registry>,
    cipher: CipherConfig,
    limits: ProxyLimitConfig,
    rooms: RoomTable,
    dial_timeout: Duration,
    idle_timeout: Duration,
    session_idle_timeout: Option<Duration>,
    rate_limits: UserRateLimits,
}

impl Dispatcher {
    /// A dispatcher for a server's listeners. Further hops are reached through `registry`.
    pub fn new(registry: &Arc<Registry>, config: &ServerConfig) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            cipher: config.cipher.clone(),
            limits: config.limits.clone(),
            rooms: RoomTable::new(),
            dial_timeout: Duration::from_millis(config.dial_timeout_ms),
            idle_timeout: Duration::from_secs(config.stream_idle_timeout_secs),
            session_idle_timeout: match config.session_idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            rate_limits: UserRateLimits::new(&config.rate_limit),
        }
    }

    /// A dispatcher acting as the exit for streams a peer opens on a client's sessions. Those
    /// sessions are already authenticated, so `cipher` is only used for bootstrap contexts.
    pub fn for_peer(registry: Weak<Registry>, cipher: CipherConfig) -> Self {
        Self {
            registry,
            cipher,
            limits: ProxyLimitConfig::default(),
            rooms: RoomTable::new(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            session_idle_timeout: None,
            rate_limits: UserRateLimits::new(&Default::default()),
        }
    }

    pub fn cipher_key(&self) -> &str {
        &self.cipher.key
    }

    pub fn handshake_timeout(&self) -> Duration {
        HANDSHAKE_TIMEOUT
    }

    pub fn rooms(&self) -> &RoomTable {
        &self.rooms
    }

    /// Authenticates `session` and serves it until it ends, then closes it.
    pub async fn serve_session(self: &Arc<Self>, session: Arc<MuxSession>) {
        let auth = ServerAuth {
            cipher: &self.cipher,
            rooms: &self.rooms,
        };

        let authenticated = match timeout(HANDSHAKE_TIMEOUT, auth.run(&session, true)).await {
            Ok(Ok(authenticated)) => authenticated,
            Ok(Err(error)) => {
                info!("Session {} from {:?} failed to authenticate: {error}", session.id(), session.remote_addr());
                session.close().await;
                return;
            }
            Err(_) => {
                info!("Session {} from {:?} didn't authenticate in time", session.id(), session.remote_addr());
                session.close().await;
                return;
            }
        };

        let request = &authenticated.request;
        if request.is_p2p_exchange() {
            // Signaling sessions poll for the peer's addresses with one exchange per stream.
            while let Ok(next) = auth.run(&session, false).await {
                debug!(room = next.request.p2p_token, "Rendezvous poll from '{}'", next.request.p2p_conn_id);
            }
        } else {
            let context = StreamContext {
                compress: authenticated.compress,
                room: request.is_p2p().then(|| (request.p2p_token.clone(), request.p2p_conn_id.clone())),
                limit: self.rate_limits.bucket_for(&request.user),
            };

            self.accept_streams(&session, Arc::new(context), self.session_idle_timeout).await;
        }

        if request.is_p2p() {
            self.rooms.leave(request, session.id());
        }

        session.close().await;
        debug!("Session {} ended", session.id());
    }

    /// Serves streams the remote end opens on an already authenticated session, until it ends.
    pub async fn serve_inbound(self: &Arc<Self>, session: Arc<MuxSession>, compress: CompressMethod) {
        let context = StreamContext {
            compress,
            room: None,
            limit: None,
        };

        self.accept_streams(&session, Arc::new(context), None).await;
    }

    /// Accepts and serves streams until the session ends or, with an `idle_limit`, until it spent
    /// that long without any stream.
    async fn accept_streams(self: &Arc<Self>, session: &Arc<MuxSession>, context: Arc<StreamContext>, idle_limit: Option<Duration>) {
        let mut last_active = Instant::now();
        loop {
            let accepted = match idle_limit {
                None => session.accept_stream().await,
                Some(limit) => select! {
                    accepted = session.accept_stream() => accepted,
                    _ = sleep(limit.min(SESSION_IDLE_CHECK_INTERVAL)) => {
                        if session.num_streams() != 0 {
                            last_active = Instant::now();
                        } else if last_active.elapsed() >= limit {
                            info!("Closing session {} after {}s without streams", session.id(), limit.as_secs());
                            break;
                        }

                        continue;
                    }
                },
            };

            last_active = Instant::now();
            let stream = match accepted {
                Ok(stream) => stream,
                Err(error) => {
                    debug!("Session {} stopped accepting streams: {error}", session.id());
                    break;
                }
            };

            let dispatcher = Arc::clone(self);
            let context = Arc::clone(&context);
            tokio::spawn(async move {
                let stream_name = format!("{stream:?}");
                if let Err(error) = dispatcher.handle_stream(stream, &context).await {
                    debug!("Stream {stream_name} ended with error: {error}");
                }
            });
        }
    }

    async fn handle_stream(&self, mut stream: MuxStream, context: &StreamContext) -> Result<()> {
        let request = match timeout(STREAM_REQUEST_TIMEOUT, read_message::<StreamRequest, _>(&mut stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout("waiting for a stream request")),
        };

        let request = match request {
            StreamRequest::Ping => {
                stream.write_u8(PONG).await?;
                stream.shutdown().await?;
                return Ok(());
            }
            StreamRequest::Connect(request) => request,
        };

        if let Some((token, conn_id)) = &context.room {
            return self.relay_to_peer(stream, request, token, conn_id).await;
        }

        let target = self.connect(&request).await?;
        let idle_timeout = match (request.read_timeout_ms, target.datagram) {
            (0, false) => None,
            (0, true) => Some(self.idle_timeout),
            (ms, _) => Some(Duration::from_millis(ms as u64)),
        };

        let stream = compress::wrap(stream, context.compress);
        let (sent, received) = relay::splice_limited(stream, target.io, idle_timeout, context.limit.as_deref()).await?;
        debug!(target = request.addr, "Relay ended after {sent} bytes sent and {received} bytes received");
        Ok(())
    }

    /// Reaches the target of `request`, directly or through its next hop.
    async fn connect(&self, request: &ConnectRequest) -> Result<Target> {
        if !self.limits.allowed(&request.addr) {
            warn!(target = request.addr, "Refusing to connect to a target outside the proxy limits");
            return Err(Error::StreamConnect {
                target: request.addr.clone(),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "Target not allowed"),
            });
        }

        if let Some((hop, forwarded)) = request.next_hop() {
            let registry = self.registry.upgrade().ok_or(Error::SessionShutdown)?;
            debug!(target = request.addr, "Forwarding through {hop} with {} hop(s) left", forwarded.hops.len());
            let io = forward(registry, hop.to_string(), forwarded).await?;
            return Ok(Target { io, datagram: false });
        }

        let dial_timeout = match request.dial_timeout_ms {
            0 => self.dial_timeout,
            ms => Duration::from_millis(ms as u64),
        };

        dial_target(&request.network, &request.addr, dial_timeout)
            .await
            .map_err(|source| Error::StreamConnect {
                target: request.addr.clone(),
                source,
            })
    }

    async fn relay_to_peer(&self, stream: MuxStream, request: ConnectRequest, token: &str, conn_id: &str) -> Result<()> {
        let peer = self
            .rooms
            .peer_session(token, conn_id)
            .ok_or_else(|| Error::Rendezvous(format!("no peer in room {token} for '{conn_id}'")))?;

        let mut peer_stream = peer.open_stream().await?;
        peer_stream.connect(request).await?;

        let (sent, received) = relay::splice(stream, peer_stream, None).await?;
        debug!(room = token, "Peer relay ended after {sent} bytes sent and {received} bytes received");
        Ok(())
    }
}

/// Opens a stream to the next hop through the registry. Boxed since serving the hop's sessions
/// leads back into the dispatcher.
fn forward(registry: Arc<Registry>, hop: String, request: ConnectRequest) -> BoxFuture<'static, Result<BoxedStream>> {
    Box::pin(async move { registry.open_connected_stream(&hop, request).await })
}

/// Dials a TCP or UDP target. The `4` and `6` suffixed networks restrict it to one address
/// family.
async fn dial_target(network: &str, addr: &str, dial_timeout: Duration) -> io::Result<Target> {
    let family: fn(&SocketAddr) -> bool = match network {
        "tcp" | "udp" => |_| true,
        "tcp4" | "udp4" => SocketAddr::is_ipv4,
        "tcp6" | "udp6" => SocketAddr::is_ipv6,
        other => {
            return Err(io::Error::new(io::ErrorKind::Unsupported, format!("Unsupported network {other}")));
        }
    };

    let datagram = network.starts_with("udp");
    let mut last_error = io::Error::new(io::ErrorKind::NotFound, format!("{addr} resolved to no usable address"));
    for target in lookup_host(addr).await?.filter(family) {
        let connected = match datagram {
            true => timeout(dial_timeout, UdpTarget::connect(target))
                .await
                .map(|result| result.map(|udp| Box::new(udp) as BoxedStream)),
            false => timeout(dial_timeout, TcpStream::connect(target)).await.map(|result| {
                result.map(|stream| {
                    let _ = stream.set_nodelay(true);
                    Box::new(stream) as BoxedStream
                })
            }),
        };

        match connected {
            Ok(Ok(io)) => return Ok(Target { io, datagram }),
            Ok(Err(error)) => last_error = error,
            Err(_) => last_error = io::Error::new(io::ErrorKind::TimedOut, format!("Connecting to {target} timed out")),
        }
    }

    Err(last_error)
}

/// A connected UDP socket. Each write sends one datagram and each read returns one.
struct UdpTarget {
    socket: UdpSocket,
}

impl UdpTarget {
    async fn connect(target: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = match target {
            SocketAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok(Self { socket })
    }
}

impl AsyncRead for UdpTarget {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpTarget {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
