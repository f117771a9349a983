use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use quinn::{ClientConfig, Connecting, Endpoint, IdleTimeout, ServerConfig, TransportConfig, VarInt};
use tokio::{net::lookup_host, select, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::{host_port, tls, FeatureSet, TransportChannel, TransportKind};
use crate::{
    cipher::CipherContext,
    config::ChannelConfig,
    dispatch::Dispatcher,
    error::{Error, Result},
    mux::{quic::quic_session, MuxSession},
};

pub const KEEPALIVE_INTERVAL_PERIOD_MILLIS: u64 = 10_000;
pub const MAX_IDLE_TIMEOUT_MILLIS: u32 = 30_000;

fn transport_config() -> TransportConfig {
    let mut transport_config = TransportConfig::default();
    transport_config.max_concurrent_uni_streams(0_u8.into());
    transport_config.keep_alive_interval(Some(Duration::from_millis(KEEPALIVE_INTERVAL_PERIOD_MILLIS)));
    transport_config.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(MAX_IDLE_TIMEOUT_MILLIS))));
    transport_config
}

pub fn configure_client() -> ClientConfig {
    let mut client_config = ClientConfig::new(Arc::new(tls::client_crypto()));
    client_config.transport_config(Arc::new(transport_config()));
    client_config
}

pub fn configure_server() -> Result<ServerConfig> {
    let (cert_chain, priv_key) = tls::generate_self_signed(vec!["localhost".into()])?;
    let mut server_config = ServerConfig::with_single_cert(cert_chain, priv_key)?;
    server_config.transport = Arc::new(transport_config());
    Ok(server_config)
}

/// Dials `quic://` servers. Each session gets its own endpoint.
pub struct QuicTransport {
    client_config: ClientConfig,
}

impl QuicTransport {
    pub fn new() -> Self {
        Self {
            client_config: configure_client(),
        }
    }
}

impl Default for QuicTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportChannel for QuicTransport {
    fn features(&self) -> FeatureSet {
        TransportKind::Quic.features()
    }

    async fn create_mux_session(&self, server: &Url, config: &ChannelConfig) -> Result<Arc<MuxSession>> {
        let target = host_port(server)?;
        let dial_error = |source: std::io::Error| Error::Dial {
            server: target.clone(),
            source,
        };

        let addr = lookup_host(target.as_str())
            .await
            .map_err(dial_error)?
            .next()
            .ok_or_else(|| dial_error(std::io::Error::new(std::io::ErrorKind::NotFound, "Host resolved to no addresses")))?;

        let bind_addr = match addr {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };

        let mut endpoint = Endpoint::client(bind_addr).map_err(dial_error)?;
        endpoint.set_default_client_config(self.client_config.clone());

        let server_name = tls::server_name(server, &config.sni);
        let connecting = endpoint
            .connect(addr, &server_name)
            .map_err(|e| dial_error(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        let connection = match timeout(config.local_dial_timeout(), connecting).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(error)) => return Err(dial_error(error.into())),
            Err(_) => return Err(Error::Timeout("connecting over QUIC")),
        };

        let cipher = CipherContext::bootstrap(&config.cipher.key, true);
        Ok(quic_session(connection, cipher, endpoint.local_addr().ok()))
    }
}

/// Accepts QUIC connections on `endpoint` and hands each resulting session to the dispatcher,
/// until `shutdown` is cancelled.
pub async fn run_listener(endpoint: Endpoint, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
    if let Ok(addr) = endpoint.local_addr() {
        info!(listen = %addr, "Accepting quic sessions");
    }

    loop {
        let incoming = select! {
            biased;
            _ = shutdown.cancelled() => break,
            incoming = endpoint.accept() => incoming,
        };

        let incoming = match incoming {
            Some(c) => c,
            None => break,
        };

        let dispatcher = Arc::clone(&dispatcher);
        let local_addr = endpoint.local_addr().ok();
        tokio::spawn(async move {
            handle_connecting(incoming, dispatcher, local_addr).await;
        });
    }

    endpoint.close(VarInt::from_u32(0), b"Server is shutting down");
    info!("quic listener closed");
}

async fn handle_connecting(incoming: Connecting, dispatcher: Arc<Dispatcher>, local_addr: Option<SocketAddr>) {
    let from = incoming.remote_address();
    let connection = match timeout(dispatcher.handshake_timeout(), incoming).await {
        Ok(Ok(c)) => c,
        Ok(Err(connection_error)) => {
            debug!("Failed to accept incoming connection from {from}: {connection_error}");
            return;
        }
        Err(_) => {
            debug!("Handshake with {from} timed out");
            return;
        }
    };

    let session = quic_session(connection, CipherContext::bootstrap(dispatcher.cipher_key(), true), local_addr);
    dispatcher.serve_session(session).await;
}
