//! Length-prefixed framing for handshake and request messages.
//!
//! A message is sent as a big-endian [`u32`] body length followed by the serialized body. Bodies
//! longer than [`MAX_MESSAGE_LEN`] are refused on both ends.

use std::io::{self, Error, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::serialize::{ByteRead, ByteWrite};

/// The largest message body accepted, in bytes.
pub const MAX_MESSAGE_LEN: usize = 1_000_000;

/// Serializes `message` and writes it as one frame, flushing the writer afterwards.
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> io::Result<()>
where
    T: ByteWrite + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut body = Vec::with_capacity(128);
    message.write(&mut body).await?;
    if body.len() > MAX_MESSAGE_LEN {
        return Err(Error::new(ErrorKind::InvalidData, format!("Message too large ({} bytes)", body.len())));
    }

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Reads one frame and deserializes its body.
pub async fn read_message<T, R>(reader: &mut R) -> io::Result<T>
where
    T: ByteRead,
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(Error::new(ErrorKind::InvalidData, format!("Message too large ({len} bytes)")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    T::read(&mut body.as_slice()).await
}
