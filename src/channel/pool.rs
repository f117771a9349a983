use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::Mutex;
use serde::Serialize;
use snova_proto::connect::ConnectRequest;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::holder::{HolderStat, SessionHolder};
use crate::{
    auth::P2PDeclaration,
    compress,
    config::ChannelConfig,
    dispatch::Dispatcher,
    error::{Error, Result},
    mux::{BoxedStream, MuxSession, MuxStream},
    transport::{parse_server_url, TransportTable},
};

/// A snapshot of a channel, for the stats dump.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStat {
    pub name: String,
    pub auto_expire: bool,
    pub idle_secs: u64,
    pub p2p_sessions: usize,
    pub holders: Vec<HolderStat>,
}

/// How a channel's holders identify themselves to the server.
#[derive(Default)]
pub struct ChannelOptions {
    /// Removed by the reaper once idle.
    pub auto_expire: bool,
    /// Relay sessions declare this, so the server hands their streams to the peer.
    pub p2p: Option<P2PDeclaration>,
    /// Serves the streams the peer opens on relay sessions.
    pub inbound: Option<Arc<Dispatcher>>,
}

/// A named pool of session holders, `conns_per_server` of them for each server.
pub struct ProxyChannel {
    config: Arc<ChannelConfig>,
    holders: Vec<Arc<SessionHolder>>,
    cursor: AtomicUsize,
    auto_expire: bool,
    last_active: Mutex<Instant>,
    p2p_sessions: Mutex<Vec<Arc<MuxSession>>>,
    /// Held shared while a stream is being acquired, exclusively while deciding to reap.
    gate: RwLock<()>,
    stopped: AtomicBool,
    shutdown: CancellationToken,
}

impl ProxyChannel {
    pub fn new(config: ChannelConfig, transports: &TransportTable, options: ChannelOptions, shutdown: CancellationToken) -> Result<Self> {
        let config = Arc::new(config);
        let mut holders = Vec::with_capacity(config.servers.len() * config.conns_per_server);
        for server in &config.servers {
            let (url, kind) = parse_server_url(server)?;
            let transport = transports.get(kind)?;
            for _ in 0..config.conns_per_server {
                holders.push(Arc::new(SessionHolder::new(
                    url.clone(),
                    kind,
                    Arc::clone(&transport),
                    Arc::clone(&config),
                    options.p2p.clone(),
                    options.inbound.clone(),
                )));
            }
        }

        if holders.is_empty() {
            return Err(Error::Config(format!("channel {} has no servers", config.name)));
        }

        Ok(Self {
            config,
            holders,
            cursor: AtomicUsize::new(0),
            auto_expire: options.auto_expire,
            last_active: Mutex::new(Instant::now()),
            p2p_sessions: Mutex::new(Vec::new()),
            gate: RwLock::new(()),
            stopped: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn is_auto_expire(&self) -> bool {
        self.auto_expire
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    /// Whether the channel was stopped. A stopped channel hands out no more streams.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Eagerly connects the first holder of every server, unless the channel connects lazily.
    /// Fails only if no eager connection could be made.
    pub async fn init(&self) -> Result<()> {
        if self.config.lazy_connect {
            return Ok(());
        }

        let mut last_error = None;
        let mut connected = 0;
        for holders in self.holders.chunks(self.config.conns_per_server) {
            match holders[0].init_now().await {
                Ok(()) => connected += 1,
                Err(error) => {
                    warn!(channel = self.config.name, server = %holders[0].server(), "Failed to connect: {error}");
                    last_error = Some(error);
                }
            }
        }

        match (connected, last_error) {
            (0, Some(error)) => Err(error),
            _ => Ok(()),
        }
    }

    /// Starts one heartbeat task per holder, stopped with the channel.
    pub fn start_heartbeats(&self) {
        let Some(interval) = self.config.heartbeat_interval() else {
            return;
        };

        for holder in &self.holders {
            let holder = Arc::clone(holder);
            let shutdown = self.shutdown.child_token();
            tokio::spawn(holder.run_heartbeat(interval, shutdown));
        }
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn add_p2p_session(&self, session: Arc<MuxSession>) {
        info!(channel = self.config.name, "Direct session {} registered", session.id());
        self.p2p_sessions.lock().push(session);
    }

    pub fn remove_p2p_session(&self, session_id: u64) {
        self.p2p_sessions.lock().retain(|session| session.id() != session_id);
    }

    pub fn has_p2p_session(&self) -> bool {
        self.p2p_sessions.lock().iter().any(|session| !session.is_closed())
    }

    async fn p2p_stream(&self) -> Option<MuxStream> {
        let sessions = self.p2p_sessions.lock().clone();
        for session in sessions {
            match session.open_stream().await {
                Ok(stream) => return Some(stream),
                Err(error) => {
                    debug!(channel = self.config.name, "Dropping direct session {}: {error}", session.id());
                    self.remove_p2p_session(session.id());
                    session.close().await;
                }
            }
        }

        None
    }

    /// Opens a stream through this channel. Direct sessions are preferred; otherwise holders are
    /// tried round-robin, each at most once, starting after the one that served the last call.
    pub async fn get_stream(&self) -> Result<MuxStream> {
        let _gate = self.gate.read().await;
        if self.is_stopped() {
            return Err(Error::ChannelNotFound(self.config.name.clone()));
        }

        if let Some(stream) = self.p2p_stream().await {
            *self.last_active.lock() = Instant::now();
            return Ok(stream);
        }

        let count = self.holders.len();
        let start = self.cursor.load(Ordering::Relaxed);
        let mut last_error = None;
        for offset in 0..count {
            let index = (start + offset) % count;
            let holder = &self.holders[index];
            match holder.get_stream().await {
                Ok(stream) => {
                    self.cursor.store((index + 1) % count, Ordering::Relaxed);
                    *self.last_active.lock() = Instant::now();
                    return Ok(stream);
                }
                Err(error) => {
                    debug!(channel = self.config.name, server = %holder.server(), "Holder {index} failed: {error}");
                    if error.is_session_shutdown() {
                        holder.close_session().await;
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(Error::NoProxyPath {
            channel: self.config.name.clone(),
            attempts: count,
            last: Box::new(last_error.unwrap_or(Error::SessionShutdown)),
        })
    }

    /// Opens a stream and asks the far end to connect it as `request` says, routed through this
    /// channel's hops. The returned stream carries the channel's compressor.
    pub async fn open_connected(&self, mut request: ConnectRequest) -> Result<BoxedStream> {
        if !self.config.hops.is_empty() {
            let mut hops = self.config.hops.clone();
            hops.append(&mut request.hops);
            request.hops = hops;
        }

        if request.dial_timeout_ms == 0 {
            request.dial_timeout_ms = self.config.remote_dial_ms_timeout.min(u32::MAX as u64) as u32;
        }

        let mut stream = self.get_stream().await?;
        stream.connect(request).await?;
        Ok(compress::wrap(stream, self.config.compress_method()))
    }

    /// Whether the channel has nothing in flight: no open streams and nothing draining.
    pub async fn is_idle(&self) -> bool {
        for holder in &self.holders {
            if !holder.is_idle().await {
                return false;
            }
        }

        true
    }

    pub async fn stat(&self) -> ChannelStat {
        let mut holders = Vec::with_capacity(self.holders.len());
        for holder in &self.holders {
            holders.push(holder.stat().await);
        }

        ChannelStat {
            name: self.config.name.clone(),
            auto_expire: self.auto_expire,
            idle_secs: self.last_active().elapsed().as_secs(),
            p2p_sessions: self.p2p_sessions.lock().len(),
            holders,
        }
    }

    /// Stops the channel if it has nothing in flight. No stream can be acquired between the check
    /// and the stop. Returns whether the channel was stopped by this call.
    pub async fn stop_if_idle(&self) -> bool {
        {
            let _gate = self.gate.write().await;
            if self.is_stopped() || !self.is_idle().await {
                return false;
            }

            self.stopped.store(true, Ordering::Release);
        }

        self.stop().await;
        true
    }

    /// Stops background tasks and closes every session of the channel.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.shutdown.cancel();
        for holder in &self.holders {
            holder.close_all().await;
        }

        let sessions = std::mem::take(&mut *self.p2p_sessions.lock());
        for session in sessions {
            session.close().await;
        }

        debug!(channel = self.config.name, "Channel stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ServerConfig,
        test_utils::{loopback_echo, MemoryNetwork, ServerFixture, TEST_KEY},
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn channel_config(servers: &[&str], conns_per_server: usize) -> ChannelConfig {
        let mut config = ChannelConfig {
            name: "pool".to_string(),
            servers: servers.iter().map(|s| s.to_string()).collect(),
            conns_per_server,
            ..Default::default()
        };
        config.cipher.key = TEST_KEY.to_string();
        config.adjust();
        config
    }

    fn channel(network: &Arc<MemoryNetwork>, config: ChannelConfig) -> ProxyChannel {
        ProxyChannel::new(config, &network.table(), ChannelOptions::default(), CancellationToken::new()).unwrap()
    }

    #[tokio::test]
    async fn test_round_robin_across_holders() {
        let network = MemoryNetwork::new(false, true);
        let server = ServerFixture::start(ServerConfig::default());
        network.add_server("relay:9000", &server);

        let pool = channel(&network, channel_config(&["tcp://relay:9000"], 3));
        let mut sessions = Vec::new();
        let mut streams = Vec::new();
        for _ in 0..6 {
            let stream = pool.get_stream().await.unwrap();
            sessions.push(stream.session_id());
            streams.push(stream);
        }

        assert_eq!(network.dials(), 3);
        assert_eq!(&sessions[..3], &sessions[3..]);
        assert_ne!(sessions[0], sessions[1]);
        assert_ne!(sessions[1], sessions[2]);
    }

    #[tokio::test]
    async fn test_fails_over_to_working_server() {
        let network = MemoryNetwork::new(false, true);
        let server = ServerFixture::start(ServerConfig::default());
        network.add_server("good:9000", &server);

        let pool = channel(&network, channel_config(&["tcp://down:9000", "tcp://good:9000"], 1));
        let stream = pool.get_stream().await.unwrap();
        drop(stream);

        let stats = pool.stat().await;
        assert!(stats.holders[0].created.is_none());
        assert!(stats.holders[1].created.is_some());
    }

    #[tokio::test]
    async fn test_all_holders_failing_is_aggregated() {
        let network = MemoryNetwork::new(false, true);
        let pool = channel(&network, channel_config(&["tcp://down:9000"], 2));

        match pool.get_stream().await {
            Err(Error::NoProxyPath { channel, attempts, .. }) => {
                assert_eq!(channel, "pool");
                assert_eq!(attempts, 2);
            }
            other => panic!("Unexpected result: {:?}", other.map(|s| s.id())),
        }
    }

    #[tokio::test]
    async fn test_p2p_session_preferred() {
        let network = MemoryNetwork::new(false, true);
        let server = ServerFixture::start(ServerConfig::default());
        network.add_server("relay:9000", &server);
        let pool = channel(&network, channel_config(&["tcp://relay:9000"], 1));

        let direct = server.client_session(snova_proto::methods::CompressMethod::None).await;
        pool.add_p2p_session(Arc::clone(&direct));
        let stream = pool.get_stream().await.unwrap();
        assert_eq!(stream.session_id(), direct.id());
        assert_eq!(network.dials(), 0);

        direct.close().await;
        let stream = pool.get_stream().await.unwrap();
        assert_ne!(stream.session_id(), direct.id());
        assert!(!pool.has_p2p_session());
    }

    #[tokio::test]
    async fn test_open_connected_through_channel() {
        let target = loopback_echo().await;
        let network = MemoryNetwork::new(false, true);
        let server = ServerFixture::start(ServerConfig::default());
        network.add_server("relay:9000", &server);

        let mut config = channel_config(&["tcp://relay:9000"], 1);
        config.compressor = "snappy".to_string();
        let pool = channel(&network, config);

        let mut stream = pool.open_connected(ConnectRequest::new("tcp", target.to_string())).await.unwrap();
        stream.write_all(b"through the pool").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 16];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the pool");
    }

    #[tokio::test]
    async fn test_stop_if_idle_waits_for_streams() {
        let network = MemoryNetwork::new(false, true);
        let server = ServerFixture::start(ServerConfig::default());
        network.add_server("relay:9000", &server);
        let pool = channel(&network, channel_config(&["tcp://relay:9000"], 1));

        let stream = pool.get_stream().await.unwrap();
        assert!(!pool.stop_if_idle().await);
        assert!(!pool.is_stopped());

        drop(stream);
        assert!(pool.stop_if_idle().await);
        assert!(pool.is_stopped());
        assert!(!pool.stop_if_idle().await);
        assert!(matches!(pool.get_stream().await, Err(Error::ChannelNotFound(_))));
        assert_eq!(network.dials(), 1);
    }

    #[tokio::test]
    async fn test_eager_init() {
        let network = MemoryNetwork::new(false, true);
        let server = ServerFixture::start(ServerConfig::default());
        network.add_server("relay:9000", &server);

        let pool = channel(&network, channel_config(&["tcp://relay:9000"], 3));
        pool.init().await.unwrap();
        assert_eq!(network.dials(), 1);

        let down = channel(&network, channel_config(&["tcp://down:9000"], 3));
        assert!(down.init().await.is_err());

        let mut lazy = channel_config(&["tcp://down:9000"], 3);
        lazy.lazy_connect = true;
        assert!(channel(&network, lazy).init().await.is_ok());
    }
}
