use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use parking_lot::Mutex;
use rand::RngCore;
use snova_proto::connect::ConnectRequest;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, enabled, info, Level};

use super::pool::{ChannelOptions, ChannelStat, ProxyChannel};
use crate::{
    auth::P2PDeclaration,
    config::{ChannelConfig, CipherConfig},
    dispatch::Dispatcher,
    error::{Error, Result},
    mux::{BoxedStream, MuxStream},
    p2p::PortMapper,
    transport::TransportTable,
};

/// How often the reaper looks for idle on-demand channels. Channels used within the last interval
/// are left alone.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(10);

/// How often [`Registry::run_stats_logger`] logs the stats dump.
pub const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Owns every channel of the process, plus what channels need to be built: the transport table,
/// the credentials of on-demand channels and this process's peer-to-peer identity.
pub struct Registry {
    me: Weak<Registry>,
    channels: Mutex<HashMap<String, Arc<ProxyChannel>>>,
    transports: TransportTable,
    ephemeral_cipher: CipherConfig,
    conn_id: String,
    port_mapper: Option<Arc<dyn PortMapper>>,
    reaper_started: AtomicBool,
    shutdown: CancellationToken,
}

fn random_conn_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl Registry {
    pub fn new(transports: TransportTable, ephemeral_cipher: CipherConfig, port_mapper: Option<Arc<dyn PortMapper>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            channels: Mutex::new(HashMap::new()),
            transports,
            ephemeral_cipher,
            conn_id: random_conn_id(),
            port_mapper,
            reaper_started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// The id this process uses in peer-to-peer rooms.
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn transports(&self) -> &TransportTable {
        &self.transports
    }

    pub fn port_mapper(&self) -> Option<&Arc<dyn PortMapper>> {
        self.port_mapper.as_ref()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// A dispatcher that serves streams opened by a peer, reaching further hops through this
    /// registry.
    pub fn peer_dispatcher(&self, cipher: CipherConfig) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::for_peer(self.me.clone(), cipher))
    }

    fn build_channel(&self, config: ChannelConfig, auto_expire: bool) -> Result<Arc<ProxyChannel>> {
        let mut options = ChannelOptions {
            auto_expire,
            ..Default::default()
        };

        if config.is_p2p() && config.p2s2p_enable {
            options.p2p = Some(P2PDeclaration {
                token: config.p2p_token.clone(),
                conn_id: self.conn_id.clone(),
                ..Default::default()
            });
            options.inbound = Some(self.peer_dispatcher(config.cipher.clone()));
        }

        let channel = ProxyChannel::new(config, &self.transports, options, self.shutdown.child_token())?;
        Ok(Arc::new(channel))
    }

    /// Registers a channel from configuration, starts its heartbeats and connects it unless it's
    /// lazy. The channel stays registered even if connecting fails; the error is returned so the
    /// caller can report it, and holders retry on demand.
    pub async fn init_channel(&self, config: ChannelConfig) -> Result<Arc<ProxyChannel>> {
        let channel = self.build_channel(config, false)?;
        let previous = self.channels.lock().insert(channel.name().to_string(), Arc::clone(&channel));
        if let Some(previous) = previous {
            previous.stop().await;
        }

        channel.start_heartbeats();
        channel.init().await?;
        info!(channel = channel.name(), "Channel ready");
        Ok(channel)
    }

    pub fn get_channel(&self, name: &str) -> Option<Arc<ProxyChannel>> {
        self.channels.lock().get(name).cloned()
    }

    /// The channel for a raw server URL, created on demand. On-demand channels connect lazily and
    /// are removed by the reaper once idle.
    pub fn channel_by_url(&self, server: &str) -> Result<Arc<ProxyChannel>> {
        let channel = {
            let mut channels = self.channels.lock();
            if let Some(channel) = channels.get(server).filter(|channel| !channel.is_stopped()) {
                return Ok(Arc::clone(channel));
            }

            let config = ChannelConfig::ephemeral(server, &self.ephemeral_cipher)?;
            let channel = self.build_channel(config, true)?;
            channels.insert(server.to_string(), Arc::clone(&channel));
            channel
        };

        debug!(channel = server, "Created on-demand channel");
        channel.start_heartbeats();
        if let Some(me) = self.me.upgrade() {
            me.start_reaper();
        }

        Ok(channel)
    }

    fn lookup(&self, channel: &str) -> Result<Arc<ProxyChannel>> {
        match self.get_channel(channel).filter(|channel| !channel.is_stopped()) {
            Some(channel) => Ok(channel),
            None if channel.contains("://") => self.channel_by_url(channel),
            None => Err(Error::ChannelNotFound(channel.to_string())),
        }
    }

    pub async fn get_stream(&self, channel: &str) -> Result<MuxStream> {
        let channel = self.get_channel(channel).ok_or_else(|| Error::ChannelNotFound(channel.to_string()))?;
        channel.get_stream().await
    }

    /// Opens a stream on the on-demand channel for `server`. A channel reaped while the stream was
    /// being acquired is replaced by a fresh one.
    pub async fn get_stream_by_url(&self, server: &str) -> Result<MuxStream> {
        let channel = self.channel_by_url(server)?;
        match channel.get_stream().await {
            Err(Error::ChannelNotFound(_)) if channel.is_stopped() => self.channel_by_url(server)?.get_stream().await,
            result => result,
        }
    }

    /// Opens a stream through `channel` (a configured name or a server URL) and connects it as
    /// `request` says.
    pub async fn open_connected_stream(&self, channel: &str, request: ConnectRequest) -> Result<BoxedStream> {
        let found = self.lookup(channel)?;
        match found.open_connected(request.clone()).await {
            Err(Error::ChannelNotFound(_)) if found.is_stopped() => self.lookup(channel)?.open_connected(request).await,
            result => result,
        }
    }

    /// Stops and removes the on-demand channels that have been idle for a whole reaper interval.
    /// Returns how many were removed.
    pub async fn reap_expired(&self) -> usize {
        self.reap_idle(REAPER_INTERVAL).await
    }

    async fn reap_idle(&self, grace: Duration) -> usize {
        let candidates: Vec<Arc<ProxyChannel>> = self
            .channels
            .lock()
            .values()
            .filter(|channel| channel.is_auto_expire() && channel.last_active().elapsed() >= grace)
            .cloned()
            .collect();

        let mut removed = 0;
        for channel in candidates {
            if !channel.stop_if_idle().await {
                continue;
            }

            let mut channels = self.channels.lock();
            if channels.get(channel.name()).is_some_and(|current| Arc::ptr_eq(current, &channel)) {
                channels.remove(channel.name());
            }

            debug!(channel = channel.name(), "Reaped idle on-demand channel");
            removed += 1;
        }

        removed
    }

    /// Starts the reaper task, once per registry.
    pub fn start_reaper(self: &Arc<Self>) {
        if self.reaper_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let registry = Arc::downgrade(self);
        let shutdown = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(REAPER_INTERVAL) => {}
                }

                let Some(registry) = registry.upgrade() else {
                    break;
                };

                let removed = registry.reap_expired().await;
                if removed != 0 {
                    info!("Reaped {removed} idle channel(s)");
                }
            }
        });
    }

    pub async fn dump_stats(&self) -> Vec<ChannelStat> {
        let channels: Vec<Arc<ProxyChannel>> = self.channels.lock().values().cloned().collect();
        let mut stats = Vec::with_capacity(channels.len());
        for channel in channels {
            stats.push(channel.stat().await);
        }

        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Logs the stats dump at debug level every [`STATS_LOG_INTERVAL`], until `shutdown` is
    /// cancelled.
    pub async fn run_stats_logger(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(STATS_LOG_INTERVAL) => {}
            }

            if enabled!(Level::DEBUG) {
                self.log_stats().await;
            }
        }
    }

    async fn log_stats(&self) {
        for stat in self.dump_stats().await {
            match serde_json::to_string(&stat) {
                Ok(json) => debug!(channel = stat.name, "Channel stats: {json}"),
                Err(error) => debug!(channel = stat.name, "Failed to serialize channel stats: {error}"),
            }
        }
    }

    /// Stops every channel and background task.
    pub async fn stop_all(&self) {
        self.shutdown.cancel();
        let channels: Vec<Arc<ProxyChannel>> = self.channels.lock().drain().map(|(_, channel)| channel).collect();
        for channel in channels {
            channel.stop().await;
        }
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

    fn test_cipher() -> CipherConfig {
        let mut cipher = CipherConfig {
            key: TEST_KEY.to_string(),
            ..Default::default()
        };
        cipher.adjust();
        cipher
    }

    fn server_config() -> ServerConfig {
        let mut config = ServerConfig {
            cipher: test_cipher(),
            ephemeral_cipher: test_cipher(),
            ..Default::default()
        };
        config.adjust();
        config
    }

    #[test]
    fn test_conn_ids_differ() {
        let a = random_conn_id();
        let b = random_conn_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_unknown_channel() {
        let registry = Registry::new(TransportTable::new(), test_cipher(), None);
        assert!(matches!(registry.get_stream("nope").await, Err(Error::ChannelNotFound(_))));
        assert!(matches!(
            registry.get_stream_by_url("gopher://relay:70").await,
            Err(Error::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn test_on_demand_channel_reused_and_reaped() {
        let network = MemoryNetwork::new(false, true);
        let server = ServerFixture::start(server_config());
        network.add_server("relay:9000", &server);
        let registry = Registry::new(network.table(), test_cipher(), None);

        let stream = registry.get_stream_by_url("tcp://relay:9000").await.unwrap();
        let again = registry.get_stream_by_url("tcp://relay:9000").await.unwrap();
        assert_eq!(registry.dump_stats().await.len(), 1);
        assert_eq!(network.dials(), 2);

        // Used just now, so not a candidate yet.
        drop((stream, again));
        assert_eq!(registry.reap_expired().await, 0);

        let channel = registry.get_channel("tcp://relay:9000").unwrap();
        assert_eq!(registry.reap_idle(Duration::ZERO).await, 1);
        assert!(registry.get_channel("tcp://relay:9000").is_none());
        assert!(channel.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_reaped_channel_replaced_on_next_use() {
        let network = MemoryNetwork::new(false, true);
        let server = ServerFixture::start(server_config());
        network.add_server("relay:9000", &server);
        let registry = Registry::new(network.table(), test_cipher(), None);

        drop(registry.get_stream_by_url("tcp://relay:9000").await.unwrap());
        let reaped = registry.get_channel("tcp://relay:9000").unwrap();
        assert!(reaped.stop_if_idle().await);

        // Still registered, but stopped: the next use builds a new channel.
        let stream = registry.get_stream_by_url("tcp://relay:9000").await.unwrap();
        let current = registry.get_channel("tcp://relay:9000").unwrap();
        assert!(!Arc::ptr_eq(&reaped, &current));
        assert_eq!(network.dials(), 2);

        // Removing the stopped channel leaves its replacement alone.
        assert_eq!(registry.reap_idle(Duration::ZERO).await, 0);
        assert!(registry.get_channel("tcp://relay:9000").is_some());
        drop(stream);
        registry.log_stats().await;
    }

    #[tokio::test]
    async fn test_busy_channel_not_reaped() {
        let network = MemoryNetwork::new(false, true);
        let server = ServerFixture::start(server_config());
        network.add_server("relay:9000", &server);
        let registry = Registry::new(network.table(), test_cipher(), None);

        let _stream = registry.get_stream_by_url("tcp://relay:9000").await.unwrap();
        let channel = registry.get_channel("tcp://relay:9000").unwrap();
        assert!(!channel.is_idle().await);
        assert_eq!(registry.reap_idle(Duration::ZERO).await, 0);
    }

    #[tokio::test]
    async fn test_three_hop_chain() {
        let target = loopback_echo().await;
        let network = MemoryNetwork::new(false, true);
        let mut fixtures = Vec::new();
        for host in ["hop1:9000", "hop2:9000", "hop3:9000"] {
            let fixture = ServerFixture::with_transports(server_config(), network.table());
            network.add_server(host, &fixture);
            fixtures.push(fixture);
        }

        let registry = Registry::new(network.table(), test_cipher(), None);
        let mut config = ChannelConfig {
            name: "chain".to_string(),
            servers: vec!["tcp://hop1:9000".to_string()],
            hops: vec!["tcp://hop2:9000".to_string(), "tcp://hop3:9000".to_string()],
            conns_per_server: 1,
            lazy_connect: true,
            cipher: test_cipher(),
            ..Default::default()
        };
        config.adjust();
        registry.init_channel(config).await.unwrap();

        let mut stream = registry
            .open_connected_stream("chain", ConnectRequest::new("tcp", target.to_string()))
            .await
            .unwrap();
        stream.write_all(b"three hops away").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 15];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"three hops away");

        // Each hop dialed the next one through an on-demand channel.
        assert!(fixtures[0].registry.get_channel("tcp://hop2:9000").is_some());
        assert!(fixtures[1].registry.get_channel("tcp://hop3:9000").is_some());
        assert!(fixtures[2].registry.dump_stats().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_all_closes_sessions() {
        let network = MemoryNetwork::new(false, true);
        let server = ServerFixture::start(server_config());
        network.add_server("relay:9000", &server);
        let registry = Registry::new(network.table(), test_cipher(), None);

        let stream = registry.get_stream_by_url("tcp://relay:9000").await.unwrap();
        let channel = registry.get_channel("tcp://relay:9000").unwrap();
        registry.stop_all().await;

        assert!(registry.dump_stats().await.is_empty());
        assert!(channel.shutdown_token().is_cancelled());
        drop(stream);
        assert!(channel.stat().await.holders.iter().all(|h| h.created.is_none()));
    }

    #[tokio::test]
    async fn test_stats_logger_runs_until_shutdown() {
        let network = MemoryNetwork::new(false, true);
        let server = ServerFixture::start(server_config());
        network.add_server("relay:9000", &server);
        let registry = Registry::new(network.table(), test_cipher(), None);
        let _stream = registry.get_stream_by_url("tcp://relay:9000").await.unwrap();

        let shutdown = CancellationToken::new();
        let logger = tokio::spawn(Arc::clone(&registry).run_stats_logger(shutdown.clone()));
        registry.log_stats().await;
        assert!(!logger.is_finished());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), logger).await.unwrap().unwrap();
    }
}
