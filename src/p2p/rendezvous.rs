//! Client side of peer-to-peer rendezvous.
//!
//! A channel with a room token runs one [`Rendezvous`] loop per server. Each attempt opens a
//! signaling session to the server, polls it for the other member's candidate addresses, races
//! direct connections to them and, if one connects, authenticates a session over it and hands it
//! to the channel. Failures only mean the channel keeps using its relayed sessions.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use snova_proto::methods::CipherMethod;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{
    portmap::PortMapping,
    punch::{race, select_role, RaceConfig},
    rooms::RoomTable,
};
use crate::{
    auth::{ClientAuth, P2PDeclaration, ServerAuth},
    channel::{ProxyChannel, Registry},
    cipher::CipherContext,
    config::ChannelConfig,
    error::{Error, Result},
    mux::{yamux::yamux_session, MuxSession, SessionRole},
    transport::{parse_server_url, tcp::reusable_socket, TransportChannel, TransportKind},
};

pub const POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(3);
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_PING_FAILURES: u32 = 3;

/// Polls per signaling session before it's replaced by a fresh one.
const MAX_POLLS: usize = 100;

/// Where the other member of the room can be reached, and how the server sees us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCandidates {
    pub private: String,
    pub public: String,
    pub own_public: String,
}

/// The hosts of a pair of candidates that failed to connect. Ports are ignored since NATs
/// usually pick a new one per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPair {
    private_host: String,
    public_host: String,
}

fn host_of(addr: &str) -> &str {
    addr.rsplit_once(':').map_or(addr, |(host, _)| host)
}

impl PeerCandidates {
    pub fn failed_pair(&self) -> FailedPair {
        FailedPair {
            private_host: host_of(&self.private).to_string(),
            public_host: host_of(&self.public).to_string(),
        }
    }
}

/// Repeats the auth exchange on `signaling` until the server reports the other member's
/// addresses. Only the first exchange rekeys, and only if `rekey` is set. Candidates on the same
/// hosts as `failed` are skipped.
pub async fn poll_peer(
    auth: &ClientAuth<'_>,
    signaling: &MuxSession,
    failed: Option<&FailedPair>,
    rekey: bool,
    interval: Duration,
    max_polls: usize,
) -> Result<PeerCandidates> {
    for round in 0..max_polls {
        let response = auth.run(signaling, rekey && round == 0).await?;

        if !response.peer_pub_addr.is_empty() {
            let candidates = PeerCandidates {
                private: response.peer_pri_addr,
                public: response.peer_pub_addr,
                own_public: match response.pub_addr.is_empty() {
                    true => auth.p2p.map(|p2p| p2p.pub_addr.clone()).unwrap_or_default(),
                    false => response.pub_addr,
                },
            };

            match failed {
                Some(failed) if *failed == candidates.failed_pair() => {
                    trace!("Peer still at {} / {}, which failed before", candidates.private, candidates.public);
                }
                _ => return Ok(candidates),
            }
        }

        if round + 1 < max_polls {
            sleep(interval).await;
        }
    }

    Err(Error::Rendezvous("no usable peer showed up".to_string()))
}

/// Runs the auth exchange over a freshly punched connection, in the given role, and returns the
/// resulting session.
pub async fn establish(stream: TcpStream, role: SessionRole, config: &ChannelConfig) -> Result<Arc<MuxSession>> {
    let local_addr = stream.local_addr().ok();
    let remote_addr = stream.peer_addr().ok();
    let cipher = CipherContext::bootstrap(&config.cipher.key, false);
    let session = yamux_session(stream, role, cipher, local_addr, remote_addr);

    let result = match role {
        SessionRole::Client => {
            let auth = ClientAuth {
                user: &config.cipher.user,
                key: &config.cipher.key,
                method: config.cipher.cipher_method(),
                compress: config.compress_method(),
                p2p: None,
            };
            auth.run(&session, true).await.map(|_| ())
        }
        SessionRole::Server => {
            let rooms = RoomTable::new();
            let auth = ServerAuth {
                cipher: &config.cipher,
                rooms: &rooms,
            };
            auth.run(&session, true).await.map(|_| ())
        }
    };

    match result {
        Ok(()) => Ok(session),
        Err(error) => {
            session.close().await;
            Err(error)
        }
    }
}

/// Pings a direct session until it fails `max_failures` times in a row or `shutdown` fires, then
/// removes it from `channel` and closes it.
pub async fn watch_liveness(
    channel: Arc<ProxyChannel>,
    session: Arc<MuxSession>,
    interval: Duration,
    max_failures: u32,
    shutdown: CancellationToken,
) {
    let mut failures = 0;
    loop {
        select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = sleep(interval) => {}
        }

        if session.is_closed() {
            debug!(channel = channel.name(), "Direct session {} closed", session.id());
            break;
        }

        match timeout(interval, session.ping()).await {
            Ok(Ok(rtt)) => {
                failures = 0;
                trace!(channel = channel.name(), "Direct session {} answered in {rtt:?}", session.id());
            }
            Ok(Err(error)) => {
                failures += 1;
                debug!(channel = channel.name(), "Direct session {} ping failed: {error}", session.id());
            }
            Err(_) => {
                failures += 1;
                debug!(channel = channel.name(), "Direct session {} ping timed out", session.id());
            }
        }

        if failures >= max_failures {
            warn!(channel = channel.name(), "Direct session {} stopped answering", session.id());
            break;
        }
    }

    channel.remove_p2p_session(session.id());
    session.close().await;
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = reusable_socket(&addr)?;
    socket.bind(addr)?;
    Ok(socket.listen(16)?)
}

fn parse_candidate(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|_| Error::Rendezvous(format!("peer sent an invalid candidate address '{addr}'")))
}

/// The rendezvous loop of one channel towards one server.
pub struct Rendezvous {
    registry: Arc<Registry>,
    channel: Arc<ProxyChannel>,
    server: Url,
    kind: TransportKind,
    transport: Arc<dyn TransportChannel>,
    race: RaceConfig,
    expose_port: u16,
}

impl Rendezvous {
    pub fn new(registry: Arc<Registry>, channel: Arc<ProxyChannel>, server: &str, expose_port: u16) -> Result<Self> {
        if !channel.config().is_p2p() {
            return Err(Error::Config(format!("channel {} has no p2p token", channel.name())));
        }

        let (server, kind) = parse_server_url(server)?;
        let transport = registry.transports().get(kind)?;
        Ok(Self {
            registry,
            channel,
            server,
            kind,
            transport,
            race: RaceConfig::default(),
            expose_port,
        })
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(channel = self.channel.name(), server = %self.server, "Starting peer-to-peer rendezvous");
        let mut failed = None;

        loop {
            if !self.channel.has_p2p_session() {
                select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    result = self.attempt(&mut failed, &shutdown) => match result {
                        Ok(()) => info!(channel = self.channel.name(), "Direct session established"),
                        Err(error) => debug!(channel = self.channel.name(), "Rendezvous attempt failed: {error}"),
                    },
                }
            }

            select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep(RETRY_INTERVAL) => {}
            }
        }

        debug!(channel = self.channel.name(), server = %self.server, "Rendezvous stopped");
    }

    async fn attempt(&self, failed: &mut Option<FailedPair>, shutdown: &CancellationToken) -> Result<()> {
        let config = self.channel.config();
        let signaling = self.transport.create_mux_session(&self.server, config).await?;

        let mapping = match (self.expose_port, self.registry.port_mapper()) {
            (0, _) | (_, None) => None,
            (port, Some(mapper)) => match PortMapping::open(mapper, port).await {
                Ok(mapping) => Some(mapping),
                Err(error) => {
                    warn!("Port mapping failed, relying on hole punching alone: {error}");
                    None
                }
            },
        };

        let result = self.punch(&signaling, mapping.as_ref(), failed, shutdown).await;

        if let Some(mapping) = mapping {
            mapping.release().await;
        }

        signaling.close().await;
        result
    }

    async fn punch(
        &self,
        signaling: &MuxSession,
        mapping: Option<&PortMapping>,
        failed: &mut Option<FailedPair>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let config = self.channel.config();
        let local = signaling
            .local_addr()
            .ok_or_else(|| Error::Rendezvous("signaling session has no local address".to_string()))?;

        let mut declaration = P2PDeclaration {
            token: config.p2p_token.clone(),
            conn_id: self.registry.conn_id().to_string(),
            pri_addr: local.to_string(),
            pub_addr: String::new(),
        };

        // A mapped port gets its own listener; otherwise listen and dial from the signaling
        // session's address so the NAT reuses its mapping.
        let (listen_addr, dial_from) = match mapping {
            Some(mapping) => {
                declaration.pri_addr = SocketAddr::new(local.ip(), mapping.port()).to_string();
                declaration.pub_addr = mapping.external_addr().to_string();
                let unspecified = match local.ip() {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                };
                (SocketAddr::new(unspecified, mapping.port()), None)
            }
            None => (local, Some(local)),
        };

        let method = match self.kind.is_encrypted() {
            true => CipherMethod::None,
            false => config.cipher.cipher_method(),
        };

        let auth = ClientAuth {
            user: &config.cipher.user,
            key: &config.cipher.key,
            method,
            compress: config.compress_method(),
            p2p: Some(&declaration),
        };

        let peer = poll_peer(&auth, signaling, failed.as_ref(), true, POLL_INTERVAL, MAX_POLLS).await?;
        let role = select_role(&peer.own_public, &peer.public);
        info!(
            channel = self.channel.name(),
            "Peer at {} / {}, racing as {role:?}",
            peer.private,
            peer.public
        );

        let outcome = self.connect_peer(&peer, role, listen_addr, dial_from).await;
        match outcome {
            Ok(session) => {
                *failed = None;
                self.register(session, shutdown);
                Ok(())
            }
            Err(error) => {
                *failed = Some(peer.failed_pair());
                Err(error)
            }
        }
    }

    async fn connect_peer(
        &self,
        peer: &PeerCandidates,
        role: SessionRole,
        listen_addr: SocketAddr,
        dial_from: Option<SocketAddr>,
    ) -> Result<Arc<MuxSession>> {
        let private = parse_candidate(&peer.private)?;
        let public = parse_candidate(&peer.public)?;
        let listener = bind_listener(listen_addr)?;
        let (stream, via) = race(Some(&listener), dial_from, private, public, &self.race)
            .await
            .map_err(|error| Error::Rendezvous(format!("no direct connection: {error}")))?;

        drop(listener);
        debug!(channel = self.channel.name(), "Direct connection via {via:?} candidate");
        establish(stream, role, self.channel.config()).await
    }

    /// Hands a direct session to the channel, serves the streams the peer opens on it and starts
    /// its liveness checks.
    fn register(&self, session: Arc<MuxSession>, shutdown: &CancellationToken) {
        let config = self.channel.config();
        self.channel.add_p2p_session(Arc::clone(&session));

        let inbound = self.registry.peer_dispatcher(config.cipher.clone());
        let compress = config.compress_method();
        let served = Arc::clone(&session);
        tokio::spawn(async move { inbound.serve_inbound(served, compress).await });

        let channel = Arc::clone(&self.channel);
        let shutdown = shutdown.child_token();
        tokio::spawn(watch_liveness(channel, session, LIVENESS_INTERVAL, MAX_PING_FAILURES, shutdown));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ChannelOptions,
        config::{CipherConfig, ServerConfig},
        test_utils::{MemoryNetwork, ServerFixture, TEST_KEY},
        transport::TransportTable,
    };
    use snova_proto::methods::CompressMethod;

    fn p2p_config() -> ChannelConfig {
        let mut config = ChannelConfig {
            name: "p2p".to_string(),
            servers: vec!["tcp://relay:9000".to_string()],
            p2p_token: "room1".to_string(),
            lazy_connect: true,
            ..Default::default()
        };
        config.cipher.key = TEST_KEY.to_string();
        config.adjust();
        config
    }

    fn declaration(conn_id: &str, pri_addr: &str) -> P2PDeclaration {
        P2PDeclaration {
            token: "room1".to_string(),
            conn_id: conn_id.to_string(),
            pri_addr: pri_addr.to_string(),
            pub_addr: String::new(),
        }
    }

    fn signaling_auth<'a>(config: &'a ChannelConfig, declaration: &'a P2PDeclaration) -> ClientAuth<'a> {
        ClientAuth {
            user: &config.cipher.user,
            key: &config.cipher.key,
            method: config.cipher.cipher_method(),
            compress: CompressMethod::None,
            p2p: Some(declaration),
        }
    }

    #[test]
    fn test_failed_pair_ignores_ports() {
        let before = PeerCandidates {
            private: "10.0.0.2:5000".into(),
            public: "[2001:db8::1]:6000".into(),
            own_public: String::new(),
        };
        let after = PeerCandidates {
            private: "10.0.0.2:5001".into(),
            public: "[2001:db8::1]:6123".into(),
            own_public: String::new(),
        };

        assert_eq!(before.failed_pair(), after.failed_pair());
        assert_eq!(host_of("[2001:db8::1]:6000"), "[2001:db8::1]");
    }

    #[tokio::test]
    async fn test_peers_learn_each_others_candidates() {
        let network = MemoryNetwork::new(false, true);
        let server = ServerFixture::start(ServerConfig::default());
        network.add_server("relay:9000", &server);

        let config = p2p_config();
        let url = Url::parse("tcp://relay:9000").unwrap();
        let transport = network.transport();
        let a_session = transport.create_mux_session(&url, &config).await.unwrap();
        let b_session = transport.create_mux_session(&url, &config).await.unwrap();

        let a = declaration("a", "10.0.0.1:5000");
        let b = declaration("b", "10.0.0.2:5000");
        let interval = Duration::from_millis(10);

        // Alone in the room, there's nobody to report yet.
        let alone = poll_peer(&signaling_auth(&config, &a), &a_session, None, true, interval, 1).await;
        assert!(matches!(alone, Err(Error::Rendezvous(_))));

        let seen_by_b = poll_peer(&signaling_auth(&config, &b), &b_session, None, true, interval, 1)
            .await
            .unwrap();
        assert_eq!(seen_by_b.private, "10.0.0.1:5000");
        assert_eq!(seen_by_b.public, "198.51.100.7:41000");
        assert_eq!(seen_by_b.own_public, "198.51.100.7:41000");

        let seen_by_a = poll_peer(&signaling_auth(&config, &a), &a_session, None, false, interval, 1)
            .await
            .unwrap();
        assert_eq!(seen_by_a.private, "10.0.0.2:5000");

        // The same hosts failed before, so they're skipped.
        let failed = seen_by_a.failed_pair();
        let skipped = poll_peer(&signaling_auth(&config, &a), &a_session, Some(&failed), false, interval, 2).await;
        assert!(matches!(skipped, Err(Error::Rendezvous(_))));
    }

    #[tokio::test]
    async fn test_establish_over_punched_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (dialed, (accepted, _)) = (dialed.unwrap(), accepted.unwrap());

        let config = p2p_config();
        let (client, server) = tokio::join!(
            establish(dialed, SessionRole::Client, &config),
            establish(accepted, SessionRole::Server, &config)
        );
        let (client, server) = (client.unwrap(), server.unwrap());
        assert_eq!(client.cipher().method(), config.cipher.cipher_method());
        assert_eq!(server.cipher().method(), config.cipher.cipher_method());

        let registry = Registry::new(TransportTable::new(), CipherConfig::default(), None);
        let inbound = registry.peer_dispatcher(config.cipher.clone());
        tokio::spawn(async move { inbound.serve_inbound(server, CompressMethod::None).await });
        assert!(client.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_liveness_drops_closed_session() {
        let network = MemoryNetwork::new(false, true);
        let server = ServerFixture::start(ServerConfig::default());
        network.add_server("relay:9000", &server);

        let channel = Arc::new(
            ProxyChannel::new(p2p_config(), &network.table(), ChannelOptions::default(), CancellationToken::new()).unwrap(),
        );
        let direct = server.client_session(CompressMethod::None).await;
        channel.add_p2p_session(Arc::clone(&direct));

        let watcher = tokio::spawn(watch_liveness(
            Arc::clone(&channel),
            Arc::clone(&direct),
            Duration::from_millis(20),
            MAX_PING_FAILURES,
            CancellationToken::new(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(channel.has_p2p_session());

        direct.close().await;
        watcher.await.unwrap();
        assert!(!channel.has_p2p_session());
    }

    #[tokio::test]
    async fn test_requires_token() {
        let network = MemoryNetwork::new(false, true);
        let registry = Registry::new(network.table(), CipherConfig::default(), None);
        let mut config = p2p_config();
        config.p2p_token.clear();
        let channel = Arc::new(ProxyChannel::new(config, &network.table(), ChannelOptions::default(), CancellationToken::new()).unwrap());

        assert!(matches!(
            Rendezvous::new(registry, channel, "tcp://relay:9000", 0),
            Err(Error::Config(_))
        ));
    }
}
