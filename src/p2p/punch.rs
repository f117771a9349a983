//! The direct connection race between two peers behind NATs.
//!
//! Each peer listens on the local address its signaling session used and, at the same time, dials
//! both of the other peer's candidates from that same address. Whatever produces a TCP connection
//! first wins: one of the outbound dials or an inbound connection on the listener.

use std::{io, net::SocketAddr, time::Duration};

use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    select,
    time::{sleep, timeout},
};
use tracing::debug;

use crate::{mux::SessionRole, transport::tcp::reusable_socket};

#[derive(Debug, Clone)]
pub struct RaceConfig {
    /// Dial attempts per candidate.
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub dial_timeout: Duration,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay: Duration::from_secs(1),
            dial_timeout: Duration::from_secs(3),
        }
    }
}

/// Which path produced the direct connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidate {
    Private,
    Public,
    Inbound,
}

/// Picks this peer's role on the direct session. Both peers compute it from the same pair of
/// public addresses, so they always pick opposite roles.
pub fn select_role(own_public: &str, peer_public: &str) -> SessionRole {
    match own_public < peer_public {
        true => SessionRole::Client,
        false => SessionRole::Server,
    }
}

async fn dial_once(local: Option<SocketAddr>, peer: SocketAddr) -> io::Result<TcpStream> {
    let socket = match local {
        Some(local) if local.is_ipv4() == peer.is_ipv4() => {
            let socket = reusable_socket(&local)?;
            socket.bind(local)?;
            socket
        }
        _ => match peer {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        },
    };

    socket.connect(peer).await
}

/// Dials `peer` from `local`, retrying until it connects or the attempts run out.
pub async fn dial_with_retries(local: Option<SocketAddr>, peer: SocketAddr, config: &RaceConfig) -> io::Result<TcpStream> {
    let mut last_error = io::Error::new(io::ErrorKind::Other, "No connection attempts were made");
    for attempt in 1..=config.max_retries {
        match timeout(config.dial_timeout, dial_once(local, peer)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(error)) => last_error = error,
            Err(_) => last_error = io::Error::new(io::ErrorKind::TimedOut, format!("Connecting to {peer} timed out")),
        }

        debug!("Attempt {attempt} to reach peer at {peer} failed: {last_error}");
        if attempt < config.max_retries {
            sleep(config.retry_delay).await;
        }
    }

    Err(last_error)
}

async fn accept_peer(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Races the dials to both candidates against inbound connections on `listener`. When several
/// complete at once the private candidate wins, then the public one, then the inbound one.
///
/// Fails once both dials have given up.
pub async fn race(
    listener: Option<&TcpListener>,
    local: Option<SocketAddr>,
    private: SocketAddr,
    public: SocketAddr,
    config: &RaceConfig,
) -> io::Result<(TcpStream, Candidate)> {
    let private_dial = dial_with_retries(local, private, config);
    let public_dial = dial_with_retries(local, public, config);
    tokio::pin!(private_dial, public_dial);

    let mut private_done = false;
    // Same address twice only needs one dial.
    let mut public_done = public == private;
    let mut last_error = None;

    while !(private_done && public_done) {
        select! {
            biased;
            result = &mut private_dial, if !private_done => match result {
                Ok(stream) => return Ok((stream, Candidate::Private)),
                Err(error) => {
                    debug!("Gave up on the private candidate {private}: {error}");
                    private_done = true;
                    last_error = Some(error);
                }
            },
            result = &mut public_dial, if !public_done => match result {
                Ok(stream) => return Ok((stream, Candidate::Public)),
                Err(error) => {
                    debug!("Gave up on the public candidate {public}: {error}");
                    public_done = true;
                    last_error = Some(error);
                }
            },
            result = accept_peer(listener) => match result {
                Ok((stream, from)) => {
                    debug!("Accepted direct connection from {from}");
                    let _ = stream.set_nodelay(true);
                    return Ok((stream, Candidate::Inbound));
                }
                Err(error) => debug!("Failed to accept a direct connection: {error}"),
            },
        }
    }

    Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "No candidate connected")))
}
