//! The authentication exchange run on the first stream of every session.
//!
//! Besides identifying the user, the request names the cipher the session switches to once the
//! exchange completes. Sessions taking part in peer-to-peer rendezvous additionally carry a room
//! token and the addresses a peer can be reached at.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::serialize::{ByteRead, ByteWrite};

pub const AUTH_FAILED: u32 = 0;
pub const AUTH_OK: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRequest {
    pub user: String,
    pub cipher_counter: u64,
    pub cipher_method: String,
    pub compress_method: String,
    /// Filler whose only purpose is to vary the size of the message.
    pub rand: String,
    pub p2p_token: String,
    pub p2p_conn_id: String,
    pub p2p_pri_addr: String,
    pub p2p_pub_addr: String,
}

impl AuthRequest {
    /// Whether this session joins a peer-to-peer room.
    pub fn is_p2p(&self) -> bool {
        !self.p2p_token.is_empty()
    }

    /// Whether this session is only used to exchange rendezvous addresses.
    pub fn is_p2p_exchange(&self) -> bool {
        self.is_p2p() && !self.p2p_pri_addr.is_empty()
    }
}

impl ByteWrite for AuthRequest {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.user.write(writer).await?;
        self.cipher_counter.write(writer).await?;
        self.cipher_method.write(writer).await?;
        self.compress_method.write(writer).await?;
        self.rand.write(writer).await?;
        self.p2p_token.write(writer).await?;
        self.p2p_conn_id.write(writer).await?;
        self.p2p_pri_addr.write(writer).await?;
        self.p2p_pub_addr.write(writer).await
    }
}

impl ByteRead for AuthRequest {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            user: String::read(reader).await?,
            cipher_counter: u64::read(reader).await?,
            cipher_method: String::read(reader).await?,
            compress_method: String::read(reader).await?,
            rand: String::read(reader).await?,
            p2p_token: String::read(reader).await?,
            p2p_conn_id: String::read(reader).await?,
            p2p_pri_addr: String::read(reader).await?,
            p2p_pub_addr: String::read(reader).await?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthResponse {
    pub code: u32,
    pub peer_pri_addr: String,
    pub peer_pub_addr: String,
    /// The requester's public address as seen (or as declared) on the server side.
    pub pub_addr: String,
}

impl AuthResponse {
    pub fn ok() -> Self {
        Self {
            code: AUTH_OK,
            ..Default::default()
        }
    }

    pub fn failed() -> Self {
        Self {
            code: AUTH_FAILED,
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == AUTH_OK
    }
}

impl ByteWrite for AuthResponse {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.code.write(writer).await?;
        self.peer_pri_addr.write(writer).await?;
        self.peer_pub_addr.write(writer).await?;
        self.pub_addr.write(writer).await
    }
}

impl ByteRead for AuthResponse {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            code: u32::read(reader).await?,
            peer_pri_addr: String::read(reader).await?,
            peer_pub_addr: String::read(reader).await?,
            pub_addr: String::read(reader).await?,
        })
    }
}
