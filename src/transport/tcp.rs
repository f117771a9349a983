use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use rustls::ServerName;
use tokio::{
    net::{lookup_host, TcpListener, TcpSocket, TcpStream},
    select,
    time::timeout,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{host_port, tls, FeatureSet, TransportChannel, TransportKind};
use crate::{
    cipher::CipherContext,
    config::ChannelConfig,
    dispatch::Dispatcher,
    error::{Error, Result},
    mux::{yamux::yamux_session, MuxSession, SessionRole},
};

/// Creates a TCP socket for `addr`'s address family that may share its local port with other
/// sockets, as needed for hole punching.
pub fn reusable_socket(addr: &SocketAddr) -> io::Result<TcpSocket> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    Ok(socket)
}

/// Dials a TCP connection to `target`, trying every resolved address in order.
pub async fn dial(target: &str, config: &ChannelConfig) -> Result<TcpStream> {
    let dial_error = |source: io::Error| Error::Dial {
        server: target.to_string(),
        source,
    };

    let addrs: Vec<SocketAddr> = lookup_host(target).await.map_err(dial_error)?.collect();
    let mut last_error = io::Error::new(io::ErrorKind::NotFound, "Host resolved to no addresses");
    for addr in addrs {
        let socket = match config.is_p2p() {
            true => reusable_socket(&addr),
            false => match addr {
                SocketAddr::V4(_) => TcpSocket::new_v4(),
                SocketAddr::V6(_) => TcpSocket::new_v6(),
            },
        }
        .map_err(dial_error)?;

        match timeout(config.local_dial_timeout(), socket.connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(error)) => {
                debug!("Failed to connect to {addr}: {error}");
                last_error = error;
            }
            Err(_) => last_error = io::Error::new(io::ErrorKind::TimedOut, format!("Connecting to {addr} timed out")),
        }
    }

    Err(dial_error(last_error))
}

/// Dials `tcp://` and `tls://` servers, multiplexing streams with yamux.
pub struct TcpTransport {
    tls: Option<TlsConnector>,
}

impl TcpTransport {
    pub fn plain() -> Self {
        Self { tls: None }
    }

    pub fn tls() -> Self {
        Self {
            tls: Some(TlsConnector::from(Arc::new(tls::client_crypto()))),
        }
    }

    fn kind(&self) -> TransportKind {
        match self.tls {
            Some(_) => TransportKind::Tls,
            None => TransportKind::Tcp,
        }
    }
}

#[async_trait]
impl TransportChannel for TcpTransport {
    fn features(&self) -> FeatureSet {
        self.kind().features()
    }

    async fn create_mux_session(&self, server: &Url, config: &ChannelConfig) -> Result<Arc<MuxSession>> {
        let target = host_port(server)?;
        let stream = dial(&target, config).await?;
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        let cipher = CipherContext::bootstrap(&config.cipher.key, self.kind().is_encrypted());

        let connector = match &self.tls {
            None => return Ok(yamux_session(stream, SessionRole::Client, cipher, local_addr, remote_addr)),
            Some(connector) => connector,
        };

        let sni = tls::server_name(server, &config.sni);
        let server_name = ServerName::try_from(sni.as_str()).map_err(|e| Error::InvalidUrl(format!("{sni}: {e}")))?;
        let tls_stream = match timeout(config.local_dial_timeout(), connector.connect(server_name, stream)).await {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(source)) => return Err(Error::Dial { server: target, source }),
            Err(_) => return Err(Error::Timeout("completing the TLS handshake")),
        };

        Ok(yamux_session(tls_stream, SessionRole::Client, cipher, local_addr, remote_addr))
    }
}

/// Accepts TCP (or TLS, when an acceptor is given) connections and hands each resulting session
/// to the dispatcher, until `shutdown` is cancelled.
pub async fn run_listener(listener: TcpListener, acceptor: Option<TlsAcceptor>, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
    let kind = match acceptor {
        Some(_) => TransportKind::Tls,
        None => TransportKind::Tcp,
    };

    match listener.local_addr() {
        Ok(addr) => info!(listen = %addr, "Accepting {kind} sessions"),
        Err(error) => warn!("Listener has no local address: {error}"),
    }

    loop {
        let accepted = select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, from) = match accepted {
            Ok(t) => t,
            Err(error) => {
                warn!("Error accepting new incoming connection: {error}");
                continue;
            }
        };

        let _ = stream.set_nodelay(true);
        let acceptor = acceptor.clone();
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let local_addr = stream.local_addr().ok();
            let cipher = CipherContext::bootstrap(dispatcher.cipher_key(), kind.is_encrypted());
            let session = match acceptor {
                None => yamux_session(stream, SessionRole::Server, cipher, local_addr, Some(from)),
                Some(acceptor) => match timeout(dispatcher.handshake_timeout(), acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => yamux_session(tls_stream, SessionRole::Server, cipher, local_addr, Some(from)),
                    Ok(Err(error)) => {
                        debug!("TLS handshake with {from} failed: {error}");
                        return;
                    }
                    Err(_) => {
                        debug!("TLS handshake with {from} timed out");
                        return;
                    }
                },
            };

            dispatcher.serve_session(session).await;
        });
    }

    info!("{kind} listener closed");
}
