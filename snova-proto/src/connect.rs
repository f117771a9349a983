//! The request that opens every stream after authentication.

use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::serialize::{ByteRead, ByteWrite, U8ReprEnum};

/// The byte sent back on a [`StreamRequest::Ping`] stream.
pub const PONG: u8 = 0x50;

/// What a newly opened stream is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRequest {
    /// Dial a target and relay bytes to it.
    Connect(ConnectRequest),

    /// Answer with a single [`PONG`] byte and close. Used to measure round-trip time.
    Ping,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamRequestType {
    Connect = 0,
    Ping = 1,
}

impl U8ReprEnum for StreamRequestType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Connect),
            1 => Some(Self::Ping),
            _ => None,
        }
    }

    fn into_u8(self) -> u8 {
        self as u8
    }
}

impl ByteWrite for StreamRequest {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        match self {
            Self::Connect(request) => {
                StreamRequestType::Connect.into_u8().write(writer).await?;
                request.write(writer).await
            }
            Self::Ping => StreamRequestType::Ping.into_u8().write(writer).await,
        }
    }
}

impl ByteRead for StreamRequest {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        match StreamRequestType::from_u8(u8::read(reader).await?) {
            Some(StreamRequestType::Connect) => Ok(Self::Connect(ConnectRequest::read(reader).await?)),
            Some(StreamRequestType::Ping) => Ok(Self::Ping),
            None => Err(Error::new(ErrorKind::InvalidData, "Invalid StreamRequest type byte")),
        }
    }
}

/// Asks the remote end to dial `addr` over `network`, or to forward the request through the
/// first of `hops` with the remaining hops attached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectRequest {
    pub network: String,
    pub addr: String,
    /// Dial timeout in milliseconds; zero means the remote end's default.
    pub dial_timeout_ms: u32,
    /// Idle read timeout in milliseconds. Zero means none for stream targets and the remote end's
    /// default for datagram targets.
    pub read_timeout_ms: u32,
    pub hops: Vec<String>,
}

impl ConnectRequest {
    pub fn new(network: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn with_hops(mut self, hops: Vec<String>) -> Self {
        self.hops = hops;
        self
    }

    /// Splits off the first hop, returning it along with the request to send to that hop.
    pub fn next_hop(&self) -> Option<(&str, ConnectRequest)> {
        let (first, rest) = self.hops.split_first()?;
        let mut forwarded = self.clone();
        forwarded.hops = rest.to_vec();
        Some((first.as_str(), forwarded))
    }
}

impl ByteWrite for ConnectRequest {
    async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        self.network.write(writer).await?;
        self.addr.write(writer).await?;
        self.dial_timeout_ms.write(writer).await?;
        self.read_timeout_ms.write(writer).await?;
        self.hops.write(writer).await
    }
}

impl ByteRead for ConnectRequest {
    async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            network: String::read(reader).await?,
            addr: String::read(reader).await?,
            dial_timeout_ms: u32::read(reader).await?,
            read_timeout_ms: u32::read(reader).await?,
            hops: Vec::<String>::read(reader).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{read_message, write_message};

    #[test]
    fn test_next_hop() {
        let request = ConnectRequest::new("tcp", "10.0.0.5:80").with_hops(vec!["tcp://h1:9000".into(), "tcp://h2:9000".into()]);

        let (hop, forwarded) = request.next_hop().unwrap();
        assert_eq!(hop, "tcp://h1:9000");
        assert_eq!(forwarded.hops, vec!["tcp://h2:9000".to_string()]);
        assert_eq!(forwarded.addr, "10.0.0.5:80");

        let (hop, last) = forwarded.next_hop().unwrap();
        assert_eq!(hop, "tcp://h2:9000");
        assert!(last.next_hop().is_none());
    }

    #[tokio::test]
    async fn test_stream_request_tags() {
        let mut buf = Vec::new();
        write_message(&mut buf, &StreamRequest::Ping).await.unwrap();
        assert_eq!(buf, [0, 0, 0, 1, 1]);

        let connect = StreamRequest::Connect(ConnectRequest::new("tcp", "example.com:443"));
        let mut buf = Vec::new();
        write_message(&mut buf, &connect).await.unwrap();
        assert_eq!(buf[4], 0);
        assert_eq!(read_message::<StreamRequest, _>(&mut buf.as_slice()).await.unwrap(), connect);

        let bad = [0u8, 0, 0, 1, 7];
        let err = read_message::<StreamRequest, _>(&mut &bad[..]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
