//! The server: listeners for every configured URL, all feeding one dispatcher.

use std::{net::SocketAddr, sync::Arc};

use quinn::Endpoint;
use tokio::net::{lookup_host, TcpListener};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    channel::Registry,
    config::ServerConfig,
    dispatch::Dispatcher,
    error::{Error, Result},
    transport::{host_port, parse_server_url, quic, tcp, tls, TransportKind, TransportTable},
};

enum Listener {
    Tcp(TcpListener, Option<TlsAcceptor>),
    Quic(Endpoint),
}

impl Listener {
    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(listener, _) => listener.local_addr().ok(),
            Self::Quic(endpoint) => endpoint.local_addr().ok(),
        }
    }
}

async fn resolve_listen_addr(listen: &str) -> Result<(TransportKind, SocketAddr)> {
    let (url, kind) = parse_server_url(listen)?;
    let target = host_port(&url)?;
    let addr = lookup_host(&target)
        .await?
        .next()
        .ok_or_else(|| Error::InvalidUrl(format!("{listen}: resolved to no address")))?;

    Ok((kind, addr))
}

async fn bind(listen: &str) -> Result<Listener> {
    let (kind, addr) = resolve_listen_addr(listen).await?;
    let listener = match kind {
        TransportKind::Tcp => Listener::Tcp(TcpListener::bind(addr).await?, None),
        TransportKind::Tls => {
            let acceptor = TlsAcceptor::from(Arc::new(tls::server_crypto()?));
            Listener::Tcp(TcpListener::bind(addr).await?, Some(acceptor))
        }
        TransportKind::Quic => Listener::Quic(Endpoint::server(quic::configure_server()?, addr)?),
        other => return Err(Error::UnsupportedScheme(other.to_string())),
    };

    Ok(listener)
}

pub struct Server {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    listeners: Vec<Listener>,
}

impl Server {
    /// Binds every listen URL of `config`. Fails if any of them can't be bound.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        if config.listen.is_empty() {
            return Err(Error::Config("the server has no listen addresses".to_string()));
        }

        let registry = Registry::new(TransportTable::with_defaults(), config.ephemeral_cipher.clone(), None);
        let dispatcher = Arc::new(Dispatcher::new(&registry, config));

        let mut listeners = Vec::with_capacity(config.listen.len());
        for listen in &config.listen {
            let listener = bind(listen).await.map_err(|error| Error::Config(format!("Failed to listen on {listen}: {error}")))?;
            listeners.push(listener);
        }

        Ok(Self {
            registry,
            dispatcher,
            listeners,
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(Listener::local_addr).collect()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Serves until `shutdown` is cancelled, then closes the listeners and every channel the
    /// server opened towards further hops.
    pub async fn run(self, shutdown: CancellationToken) {
        self.registry.start_reaper();
        tokio::spawn(Arc::clone(&self.registry).run_stats_logger(shutdown.child_token()));

        let mut handles = Vec::with_capacity(self.listeners.len());
        for listener in self.listeners {
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown = shutdown.child_token();
            let handle = match listener {
                Listener::Tcp(listener, acceptor) => tokio::spawn(tcp::run_listener(listener, acceptor, dispatcher, shutdown)),
                Listener::Quic(endpoint) => tokio::spawn(quic::run_listener(endpoint, dispatcher, shutdown)),
            };
            handles.push(handle);
        }

        shutdown.cancelled().await;
        info!("Server shutting down");
        for handle in handles {
            if let Err(error) = handle.await {
                warn!("Listener task failed: {error}");
            }
        }

        self.registry.stop_all().await;
    }
}
