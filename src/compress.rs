use std::io::{self, Error, ErrorKind};

use snap::raw::{Decoder, Encoder};
use snova_proto::methods::CompressMethod;

use crate::{
    codec::{ChunkCodec, ChunkStream},
    mux::{AsyncStream, BoxedStream},
};

struct SnappyCodec {
    encoder: Encoder,
    decoder: Decoder,
}

impl SnappyCodec {
    fn new() -> Self {
        Self {
            encoder: Encoder::new(),
            decoder: Decoder::new(),
        }
    }
}

impl ChunkCodec for SnappyCodec {
    fn encode(&mut self, plain: &[u8]) -> io::Result<Vec<u8>> {
        self.encoder.compress_vec(plain).map_err(|e| Error::new(ErrorKind::InvalidData, e))
    }

    fn decode(&mut self, chunk: Vec<u8>) -> io::Result<Vec<u8>> {
        self.decoder.decompress_vec(&chunk).map_err(|e| Error::new(ErrorKind::InvalidData, e))
    }
}

/// Wraps `stream` so that bytes travelling through it are compressed with `method`.
pub fn wrap<S: AsyncStream + 'static>(stream: S, method: CompressMethod) -> BoxedStream {
    match method {
        CompressMethod::None => Box::new(stream),
        CompressMethod::Snappy => Box::new(ChunkStream::new(stream, Box::new(SnappyCodec::new()), Box::new(SnappyCodec::new()))),
    }
}
