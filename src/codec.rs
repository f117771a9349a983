//! Chunked stream transforms.
//!
//! [`ChunkStream`] wraps a byte stream and passes every written chunk through a [`ChunkCodec`]
//! before framing it as `{u16 length}{encoded chunk}`. Reads undo the framing and pass each
//! chunk through the decoding codec. Ciphers and compressors are both implemented this way.

use std::{
    io::{self, Error, ErrorKind},
    pin::Pin,
    task::{ready, Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Largest amount of plain bytes encoded into a single chunk.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 - 1;

/// Transforms chunks in one direction of a stream. Codecs are stateful, chunks are always
/// encoded and decoded in the order they appear on the wire.
pub trait ChunkCodec: Send {
    fn encode(&mut self, plain: &[u8]) -> io::Result<Vec<u8>>;

    fn decode(&mut self, chunk: Vec<u8>) -> io::Result<Vec<u8>>;
}

enum ReadState {
    Length { buf: [u8; 2], pos: usize },
    Chunk { buf: Vec<u8>, pos: usize },
}

impl ReadState {
    const fn new() -> Self {
        Self::Length { buf: [0; 2], pos: 0 }
    }
}

pub struct ChunkStream<S> {
    inner: S,
    encoder: Box<dyn ChunkCodec>,
    decoder: Box<dyn ChunkCodec>,
    read_state: ReadState,
    plain: Vec<u8>,
    plain_pos: usize,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> ChunkStream<S> {
    pub fn new(inner: S, encoder: Box<dyn ChunkCodec>, decoder: Box<dyn ChunkCodec>) -> Self {
        Self {
            inner,
            encoder,
            decoder,
            read_state: ReadState::new(),
            plain: Vec::new(),
            plain_pos: 0,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncWrite + Unpin> ChunkStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let written = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..]))?;
            if written == 0 {
                return Poll::Ready(Err(Error::from(ErrorKind::WriteZero)));
            }

            self.pending_pos += written;
        }

        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ChunkStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.plain_pos < this.plain.len() {
                let len = buf.remaining().min(this.plain.len() - this.plain_pos);
                buf.put_slice(&this.plain[this.plain_pos..(this.plain_pos + len)]);
                this.plain_pos += len;
                return Poll::Ready(Ok(()));
            }

            match &mut this.read_state {
                ReadState::Length { buf: len_buf, pos } => {
                    let mut read_buf = ReadBuf::new(&mut len_buf[*pos..]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
                    let n = read_buf.filled().len();
                    if n == 0 {
                        return match *pos {
                            0 => Poll::Ready(Ok(())),
                            _ => Poll::Ready(Err(Error::new(ErrorKind::UnexpectedEof, "Stream ended inside a chunk header"))),
                        };
                    }

                    *pos += n;
                    if *pos == len_buf.len() {
                        let len = u16::from_be_bytes(*len_buf) as usize;
                        if len == 0 {
                            return Poll::Ready(Err(Error::new(ErrorKind::InvalidData, "Empty chunk")));
                        }

                        this.read_state = ReadState::Chunk { buf: vec![0; len], pos: 0 };
                    }
                }
                ReadState::Chunk { buf: chunk, pos } => {
                    let mut read_buf = ReadBuf::new(&mut chunk[*pos..]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
                    let n = read_buf.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(Error::new(ErrorKind::UnexpectedEof, "Stream ended inside a chunk")));
                    }

                    *pos += n;
                    if *pos == chunk.len() {
                        let chunk = std::mem::take(chunk);
                        this.read_state = ReadState::new();
                        this.plain = this.decoder.decode(chunk)?;
                        this.plain_pos = 0;
                    }
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ChunkStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let len = buf.len().min(MAX_CHUNK_SIZE);
        let chunk = this.encoder.encode(&buf[..len])?;
        let chunk_len = u16::try_from(chunk.len()).map_err(|_| Error::new(ErrorKind::InvalidData, "Encoded chunk too large"))?;
        this.pending.extend_from_slice(&chunk_len.to_be_bytes());
        this.pending.extend_from_slice(&chunk);

        // The chunk is ours now, whatever isn't written here goes out on the next call.
        if let Poll::Ready(Err(error)) = this.poll_drain(cx) {
            return Poll::Ready(Err(error));
        }

        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
