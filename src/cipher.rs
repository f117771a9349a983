//! Per-session cipher contexts and the stream encryption built from them.
//!
//! A session starts out with a bootstrap context and switches to the context negotiated during
//! authentication. Each stream derives its own pair of keys from the session context, its stream
//! id and the direction of travel, so no two streams (or directions) share a key.

use std::io::{self, Error, ErrorKind};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::ChaCha20Poly1305;
use salsa20::{
    cipher::{KeyIvInit, StreamCipher},
    Salsa20,
};
use sha2::{Digest, Sha256};
use snova_proto::methods::CipherMethod;

use crate::codec::ChunkCodec;

/// The counter used for the bootstrap context, before authentication rekeys the session.
pub const DEFAULT_INITIAL_COUNTER: u64 = 47816489;

const NONCE_SIZE: usize = 12;

/// Which end of a stream is writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Written by the end that opened the stream.
    Outbound,

    /// Written by the end that accepted the stream.
    Inbound,
}

impl Direction {
    const fn tag(self) -> u8 {
        match self {
            Self::Outbound => b'o',
            Self::Inbound => b'i',
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct CipherContext {
    method: CipherMethod,
    key: [u8; 32],
    counter: u64,
}

impl std::fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherContext")
            .field("method", &self.method)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl CipherContext {
    pub fn new(method: CipherMethod, key: &str, counter: u64) -> Self {
        Self {
            method,
            key: Sha256::digest(key.as_bytes()).into(),
            counter,
        }
    }

    pub fn none() -> Self {
        Self::new(CipherMethod::None, "", 0)
    }

    /// The context every session starts with. Transports that are already encrypted skip the
    /// inner cipher entirely.
    pub fn bootstrap(key: &str, transport_encrypted: bool) -> Self {
        match transport_encrypted {
            true => Self::none(),
            false => Self::new(CipherMethod::Chacha20Poly1305, key, DEFAULT_INITIAL_COUNTER),
        }
    }

    pub fn method(&self) -> CipherMethod {
        self.method
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    fn derive_key(&self, stream_id: u64, direction: Direction) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(self.method.as_str().as_bytes());
        hasher.update(self.counter.to_be_bytes());
        hasher.update(stream_id.to_be_bytes());
        hasher.update([direction.tag()]);
        hasher.finalize().into()
    }

    /// Builds the codec that encrypts chunks travelling in `direction` on stream `stream_id`.
    /// Returns `None` when this context doesn't encrypt.
    pub fn codec(&self, stream_id: u64, direction: Direction) -> Option<Box<dyn ChunkCodec>> {
        let key = self.derive_key(stream_id, direction);
        let codec: Box<dyn ChunkCodec> = match self.method {
            CipherMethod::None => return None,
            CipherMethod::Chacha20Poly1305 => Box::new(AeadCodec {
                cipher: AeadKind::Chacha(ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key))),
                sequence: 0,
            }),
            CipherMethod::Aes256Gcm => Box::new(AeadCodec {
                cipher: AeadKind::Aes(Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&key))),
                sequence: 0,
            }),
            CipherMethod::Salsa20 => Box::new(Salsa20Codec {
                cipher: Salsa20::new(salsa20::Key::from_slice(&key), salsa20::Nonce::from_slice(&[0u8; 8])),
            }),
        };

        Some(codec)
    }
}

enum AeadKind {
    Chacha(ChaCha20Poly1305),
    Aes(Aes256Gcm),
}

/// Seals every chunk on its own, using the chunk's sequence number as the nonce.
struct AeadCodec {
    cipher: AeadKind,
    sequence: u64,
}

impl AeadCodec {
    fn next_nonce(&mut self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[4..].copy_from_slice(&self.sequence.to_be_bytes());
        self.sequence = self.sequence.wrapping_add(1);
        nonce
    }
}

impl ChunkCodec for AeadCodec {
    fn encode(&mut self, plain: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let nonce = Nonce::from_slice(&nonce);
        let sealed = match &self.cipher {
            AeadKind::Chacha(cipher) => cipher.encrypt(nonce, plain),
            AeadKind::Aes(cipher) => cipher.encrypt(nonce, plain),
        };

        sealed.map_err(|_| Error::new(ErrorKind::InvalidData, "Failed to seal chunk"))
    }

    fn decode(&mut self, chunk: Vec<u8>) -> io::Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let nonce = Nonce::from_slice(&nonce);
        let opened = match &self.cipher {
            AeadKind::Chacha(cipher) => cipher.decrypt(nonce, chunk.as_slice()),
            AeadKind::Aes(cipher) => cipher.decrypt(nonce, chunk.as_slice()),
        };

        opened.map_err(|_| Error::new(ErrorKind::InvalidData, "Failed to open chunk, wrong key or corrupted data"))
    }
}

/// Unauthenticated keystream cipher, continuing the keystream across chunks.
struct Salsa20Codec {
    cipher: Salsa20,
}

impl ChunkCodec for Salsa20Codec {
    fn encode(&mut self, plain: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = plain.to_vec();
        self.cipher.apply_keystream(&mut out);
        Ok(out)
    }

    fn decode(&mut self, mut chunk: Vec<u8>) -> io::Result<Vec<u8>> {
        self.cipher.apply_keystream(&mut chunk);
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ChunkStream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pipe(writer: &CipherContext, reader: &CipherContext, stream_id: u64) -> (ChunkStream<tokio::io::DuplexStream>, ChunkStream<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let opener = ChunkStream::new(
            a,
            writer.codec(stream_id, Direction::Outbound).unwrap(),
            writer.codec(stream_id, Direction::Inbound).unwrap(),
        );
        let acceptor = ChunkStream::new(
            b,
            reader.codec(stream_id, Direction::Inbound).unwrap(),
            reader.codec(stream_id, Direction::Outbound).unwrap(),
        );
        (opener, acceptor)
    }

    #[tokio::test]
    async fn test_every_method_both_directions() {
        for method in [CipherMethod::Chacha20Poly1305, CipherMethod::Aes256Gcm, CipherMethod::Salsa20] {
            let context = CipherContext::new(method, "shared secret", 7);
            let (mut opener, mut acceptor) = pipe(&context, &context, 3);

            opener.write_all(b"hello from the opener").await.unwrap();
            opener.flush().await.unwrap();
            let mut buf = [0u8; 21];
            acceptor.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello from the opener");

            acceptor.write_all(b"and back").await.unwrap();
            acceptor.flush().await.unwrap();
            let mut buf = [0u8; 8];
            opener.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"and back", "{method}");
        }
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let good = CipherContext::new(CipherMethod::Chacha20Poly1305, "right", 1);
        let bad = CipherContext::new(CipherMethod::Chacha20Poly1305, "wrong", 1);
        let (mut opener, mut acceptor) = pipe(&good, &bad, 1);

        opener.write_all(b"secret").await.unwrap();
        opener.flush().await.unwrap();
        let mut buf = [0u8; 6];
        let err = acceptor.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_keys_are_per_stream_and_direction() {
        let context = CipherContext::new(CipherMethod::Aes256Gcm, "k", 1);
        let a = context.derive_key(1, Direction::Outbound);
        assert_ne!(a, context.derive_key(1, Direction::Inbound));
        assert_ne!(a, context.derive_key(3, Direction::Outbound));
        assert_ne!(a, CipherContext::new(CipherMethod::Aes256Gcm, "k", 2).derive_key(1, Direction::Outbound));
    }

    #[test]
    fn test_bootstrap() {
        assert_eq!(CipherContext::bootstrap("k", true).method(), CipherMethod::None);
        assert!(CipherContext::none().codec(1, Direction::Outbound).is_none());

        let bootstrap = CipherContext::bootstrap("k", false);
        assert_eq!(bootstrap.method(), CipherMethod::Chacha20Poly1305);
        assert_eq!(bootstrap.counter(), DEFAULT_INITIAL_COUNTER);
    }
}
