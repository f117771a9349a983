//! Error types shared by the channel, session and dispatcher layers.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The transport could not connect or complete its own handshake.
    #[error("Failed to dial {server}: {source}")]
    Dial { server: String, source: io::Error },

    /// Bad user, invalid compressor or a room that can't take this member.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The multiplexer reports the session is dead.
    #[error("Session is shut down")]
    SessionShutdown,

    /// The remote end couldn't reach the requested target.
    #[error("Failed to connect to {target}: {source}")]
    StreamConnect { target: String, source: io::Error },

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error("Peer-to-peer rendezvous failed: {0}")]
    Rendezvous(String),

    /// Every session holder of a channel failed to produce a stream.
    #[error("No proxy path available through channel {channel} ({attempts} attempts, last error: {last})")]
    NoProxyPath { channel: String, attempts: usize, last: Box<Error> },

    #[error("No channel named {0}")]
    ChannelNotFound(String),

    #[error("Unsupported transport scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid URL {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

impl Error {
    /// Whether this error means the session it came from can't be used anymore.
    pub fn is_session_shutdown(&self) -> bool {
        match self {
            Self::SessionShutdown => true,
            Self::Io(error) => matches!(
                error.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
