//! A pool slot owning at most one live session to one server.
//!
//! The live session is replaced, never mutated. When it expires it moves to the draining list,
//! where it keeps serving the streams already open on it and is closed once the last of them is
//! dropped. A holder never retries on its own: a failed init leaves the slot empty and the next
//! caller tries again.

use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use rand::Rng;
use serde::Serialize;
use snova_proto::methods::CipherMethod;
use tokio::{select, sync::Mutex, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    auth::{ClientAuth, P2PDeclaration},
    config::ChannelConfig,
    dispatch::Dispatcher,
    error::Result,
    mux::{MuxSession, MuxStream},
    transport::{FeatureSet, TransportChannel, TransportKind},
};

const PING_TIMEOUT: Duration = Duration::from_secs(10);

enum Slot {
    Empty,
    Active {
        session: Arc<MuxSession>,
        created: SystemTime,
        expire: Option<Instant>,
    },
}

struct HolderState {
    slot: Slot,
    draining: Vec<Arc<MuxSession>>,
    active_time: Instant,
}

impl HolderState {
    /// Moves the live session to the draining list if it's past its expiry.
    fn retire_expired(&mut self, now: Instant) {
        let expired = matches!(&self.slot, Slot::Active { expire: Some(expire), .. } if now >= *expire);
        if expired {
            self.retire();
        }
    }

    fn retire(&mut self) {
        if let Slot::Active { session, .. } = std::mem::replace(&mut self.slot, Slot::Empty) {
            debug!("Retiring session {} with {} live streams", session.id(), session.num_streams());
            self.draining.push(session);
        }
    }

    /// Closes and forgets the draining sessions that have no streams left.
    async fn close_drained(&mut self) {
        let mut i = 0;
        while i < self.draining.len() {
            let session = &self.draining[i];
            if session.num_streams() == 0 || session.is_closed() {
                let session = self.draining.swap_remove(i);
                session.close().await;
            } else {
                i += 1;
            }
        }
    }

    fn live_session(&self) -> Option<&Arc<MuxSession>> {
        match &self.slot {
            Slot::Active { session, .. } if !session.is_closed() => Some(session),
            _ => None,
        }
    }
}

/// A snapshot of a holder, for the stats dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HolderStat {
    pub server: String,
    /// Unix timestamps, in seconds.
    pub created: Option<u64>,
    pub expires: Option<u64>,
    pub streams: usize,
    pub retired: usize,
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

pub struct SessionHolder {
    server: Url,
    kind: TransportKind,
    transport: Arc<dyn TransportChannel>,
    config: Arc<ChannelConfig>,
    p2p: Option<P2PDeclaration>,
    inbound: Option<Arc<Dispatcher>>,
    state: Mutex<HolderState>,
}

impl SessionHolder {
    pub fn new(
        server: Url,
        kind: TransportKind,
        transport: Arc<dyn TransportChannel>,
        config: Arc<ChannelConfig>,
        p2p: Option<P2PDeclaration>,
        inbound: Option<Arc<Dispatcher>>,
    ) -> Self {
        Self {
            server,
            kind,
            transport,
            config,
            p2p,
            inbound,
            state: Mutex::new(HolderState {
                slot: Slot::Empty,
                draining: Vec::new(),
                active_time: Instant::now(),
            }),
        }
    }

    pub fn server(&self) -> &Url {
        &self.server
    }

    fn features(&self) -> FeatureSet {
        self.transport.features()
    }

    /// Dials, authenticates and installs a new live session. The slot must be empty.
    async fn init(&self, state: &mut HolderState) -> Result<Arc<MuxSession>> {
        let config = &self.config;
        let session = self.transport.create_mux_session(&self.server, config).await?;

        let method = match self.kind.is_encrypted() {
            true => CipherMethod::None,
            false => config.cipher.cipher_method(),
        };

        let auth = ClientAuth {
            user: &config.cipher.user,
            key: &config.cipher.key,
            method,
            compress: config.compress_method(),
            p2p: self.p2p.as_ref(),
        };

        if let Err(error) = auth.run(&session, true).await {
            session.close().await;
            return Err(error);
        }

        let expire = self.features().auto_expire.then(|| {
            let (min, max) = config.expire_range();
            Instant::now() + rand::thread_rng().gen_range(min..=max)
        });

        if let Some(inbound) = &self.inbound {
            let inbound = Arc::clone(inbound);
            let session = Arc::clone(&session);
            let compress = config.compress_method();
            tokio::spawn(async move { inbound.serve_inbound(session, compress).await });
        }

        info!(server = %self.server, channel = config.name, "Session {} established", session.id());
        state.slot = Slot::Active {
            session: Arc::clone(&session),
            created: SystemTime::now(),
            expire,
        };

        Ok(session)
    }

    /// Opens a stream on the live session, creating the session first if there is none.
    pub async fn get_stream(&self) -> Result<MuxStream> {
        let session = {
            let mut state = self.state.lock().await;
            state.retire_expired(Instant::now());
            state.close_drained().await;

            let session = match state.live_session() {
                Some(session) => Arc::clone(session),
                None => {
                    state.slot = Slot::Empty;
                    self.init(&mut state).await?
                }
            };

            state.active_time = Instant::now();
            session
        };

        session.open_stream().await
    }

    /// Establishes a session right away, unless one is already live.
    pub async fn init_now(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.live_session().is_none() {
            state.slot = Slot::Empty;
            self.init(&mut state).await?;
        }

        Ok(())
    }

    /// Closes the live session, leaving the slot empty.
    pub async fn close_session(&self) {
        let mut state = self.state.lock().await;
        if let Slot::Active { session, .. } = std::mem::replace(&mut state.slot, Slot::Empty) {
            session.close().await;
        }
    }

    /// Closes every session, live or draining.
    pub async fn close_all(&self) {
        let mut state = self.state.lock().await;
        if let Slot::Active { session, .. } = std::mem::replace(&mut state.slot, Slot::Empty) {
            session.close().await;
        }

        for session in state.draining.drain(..) {
            session.close().await;
        }
    }

    /// Whether this holder has no draining sessions and no open streams.
    pub async fn is_idle(&self) -> bool {
        let mut state = self.state.lock().await;
        state.close_drained().await;
        state.draining.is_empty() && state.live_session().map_or(true, |session| session.num_streams() == 0)
    }

    pub async fn stat(&self) -> HolderStat {
        let mut state = self.state.lock().await;
        state.close_drained().await;

        let (created, expires, streams) = match &state.slot {
            Slot::Active { session, created, expire } => {
                let expires = expire.map(|expire| SystemTime::now() + expire.saturating_duration_since(Instant::now()));
                (Some(unix_secs(*created)), expires.map(unix_secs), session.num_streams())
            }
            Slot::Empty => (None, None, 0),
        };

        HolderStat {
            server: self.server.to_string(),
            created,
            expires,
            streams,
            retired: state.draining.len(),
        }
    }

    /// One heartbeat round: rotates an expired session, probes the live one if the transport
    /// supports pings, and keeps an idle holder warm unless the channel connects lazily.
    pub async fn heartbeat(&self) {
        let config = &self.config;
        let mut state = self.state.lock().await;
        state.retire_expired(Instant::now());
        state.close_drained().await;

        let session = match state.live_session() {
            Some(session) => Arc::clone(session),
            None => {
                if !config.lazy_connect {
                    state.slot = Slot::Empty;
                    if let Err(error) = self.init(&mut state).await {
                        warn!(server = %self.server, "Failed to re-establish session: {error}");
                    }
                }
                return;
            }
        };

        if !self.features().pingable {
            if !config.lazy_connect && state.active_time.elapsed() > config.hibernate_after() {
                debug!(server = %self.server, "Refreshing session {} after hibernation", session.id());
                state.retire();
                match self.init(&mut state).await {
                    Ok(_) => state.active_time = Instant::now(),
                    Err(error) => warn!(server = %self.server, "Failed to refresh session: {error}"),
                }
            }
            return;
        }

        // Pings may take a while, don't hold up streams meanwhile.
        drop(state);
        match timeout(PING_TIMEOUT, session.ping()).await {
            Ok(Ok(rtt)) => debug!(server = %self.server, "Session {} ping took {}ms", session.id(), rtt.as_millis()),
            Ok(Err(error)) => {
                warn!(server = %self.server, "Ping on session {} failed: {error}", session.id());
                self.drop_session(&session).await;
            }
            Err(_) => {
                warn!(server = %self.server, "Ping on session {} timed out", session.id());
                self.drop_session(&session).await;
            }
        }
    }

    /// Closes `session` and empties the slot, if `session` is still the live one.
    async fn drop_session(&self, session: &Arc<MuxSession>) {
        let mut state = self.state.lock().await;
        if matches!(&state.slot, Slot::Active { session: live, .. } if live.id() == session.id()) {
            state.slot = Slot::Empty;
        }
        session.close().await;
    }

    /// Runs heartbeats every `interval` until `shutdown` is cancelled.
    pub async fn run_heartbeat(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        loop {
            select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            self.heartbeat().await;
        }

        debug!(server = %self.server, "Heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ServerConfig,
        test_utils::{loopback_echo, MemoryNetwork, ServerFixture, TEST_KEY},
        transport::parse_server_url,
    };
    use snova_proto::connect::ConnectRequest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_round_trip(stream: &mut MuxStream, payload: &[u8]) {
        stream.write_all(payload).await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, payload);
    }

    fn holder(network: &Arc<MemoryNetwork>, config: ChannelConfig) -> SessionHolder {
        let (url, kind) = parse_server_url(&config.servers[0]).unwrap();
        SessionHolder::new(url, kind, network.transport(), Arc::new(config), None, None)
    }

    fn network_with_server(auto_expire: bool) -> (Arc<MemoryNetwork>, ServerFixture) {
        let network = MemoryNetwork::new(auto_expire, true);
        let server = ServerFixture::start(ServerConfig::default());
        network.add_server("relay:9000", &server);
        (network, server)
    }

    fn channel_config(reconnect_period: u64) -> ChannelConfig {
        let mut config = ChannelConfig {
            name: "test".to_string(),
            servers: vec!["tcp://relay:9000".to_string()],
            reconnect_period,
            ..Default::default()
        };
        config.cipher.key = TEST_KEY.to_string();
        config.adjust();
        config
    }

    #[tokio::test]
    async fn test_lazy_init_and_reuse() {
        let (network, _server) = network_with_server(false);
        let holder = holder(&network, channel_config(0));
        assert_eq!(holder.stat().await.created, None);

        let first = holder.get_stream().await.unwrap();
        let second = holder.get_stream().await.unwrap();
        assert_eq!(first.session_id(), second.session_id());
        assert_eq!(network.dials(), 1);

        let stat = holder.stat().await;
        assert!(stat.created.is_some());
        assert_eq!(stat.expires, None);
        assert_eq!(stat.streams, 2);
    }

    #[tokio::test]
    async fn test_init_failure_leaves_slot_empty() {
        let (network, _server) = network_with_server(false);
        let holder = holder(&network, channel_config(0));

        network.set_failing(true);
        assert!(holder.get_stream().await.is_err());
        assert_eq!(holder.stat().await.created, None);

        network.set_failing(false);
        assert!(holder.get_stream().await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_session_drains_then_closes() {
        let target = loopback_echo().await;
        let (network, _server) = network_with_server(true);
        let holder = holder(&network, channel_config(1));

        let mut old_stream = holder.get_stream().await.unwrap();
        let old_session = old_stream.session_id();
        old_stream.connect(ConnectRequest::new("tcp", target.to_string())).await.unwrap();
        echo_round_trip(&mut old_stream, b"before rotation").await;

        // Without jitter, sessions expire exactly one second after creation.
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let new_stream = holder.get_stream().await.unwrap();
        assert_ne!(new_stream.session_id(), old_session);
        assert_eq!(holder.stat().await.retired, 1);

        // The retired session still carries its open stream until it's dropped.
        echo_round_trip(&mut old_stream, b"after rotation").await;
        assert_eq!(holder.stat().await.retired, 1);
        drop(old_stream);
        let stat = holder.stat().await;
        assert_eq!(stat.retired, 0);
        assert_eq!(stat.streams, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_replaces_dead_session() {
        let (network, _server) = network_with_server(false);
        let mut config = channel_config(0);
        config.lazy_connect = false;
        let holder = holder(&network, config);

        holder.heartbeat().await;
        assert_eq!(network.dials(), 1);
        holder.heartbeat().await;
        assert_eq!(network.dials(), 1);

        network.close_all_server_sessions().await;
        holder.heartbeat().await;
        holder.heartbeat().await;
        assert_eq!(network.dials(), 2);
        assert!(holder.is_idle().await);
    }

    #[tokio::test]
    async fn test_hibernate_refresh_happens_once() {
        let network = MemoryNetwork::new(false, false);
        let server = ServerFixture::start(ServerConfig::default());
        network.add_server("relay:9000", &server);

        let mut config = channel_config(0);
        config.lazy_connect = false;
        config.hibernate_after_secs = 1;
        let holder = holder(&network, config);

        holder.heartbeat().await;
        assert_eq!(network.dials(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        holder.heartbeat().await;
        assert_eq!(network.dials(), 2);

        // The refresh counts as activity, so the next ticks keep the new session.
        holder.heartbeat().await;
        holder.heartbeat().await;
        assert_eq!(network.dials(), 2);
        assert_eq!(holder.stat().await.retired, 0);
    }
}
