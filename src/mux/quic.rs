use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use quinn::{Connection, ConnectionError, VarInt};
use tracing::debug;

use super::{MuxSession, RawMux, RawStream};
use crate::{
    cipher::CipherContext,
    error::{Error, Result},
};

struct QuicMux {
    connection: Connection,
}

/// Wraps an established QUIC connection. Every bidirectional QUIC stream is one session stream.
///
/// Streams only become visible to the peer once something is written to them.
pub fn quic_session(connection: Connection, cipher: CipherContext, local_addr: Option<SocketAddr>) -> Arc<MuxSession> {
    let remote_addr = connection.remote_address();
    MuxSession::new(QuicMux { connection }, cipher, local_addr, Some(remote_addr))
}

fn map_connection_error(error: ConnectionError) -> Error {
    debug!("QUIC connection error: {error}");
    Error::SessionShutdown
}

#[async_trait]
impl RawMux for QuicMux {
    async fn open(&self) -> Result<RawStream> {
        let (send_stream, recv_stream) = self.connection.open_bi().await.map_err(map_connection_error)?;
        Ok(RawStream {
            id: send_stream.id().index(),
            io: Box::new(tokio::io::join(recv_stream, send_stream)),
        })
    }

    async fn accept(&self) -> Result<RawStream> {
        let (send_stream, recv_stream) = self.connection.accept_bi().await.map_err(map_connection_error)?;
        Ok(RawStream {
            id: send_stream.id().index(),
            io: Box::new(tokio::io::join(recv_stream, send_stream)),
        })
    }

    async fn close(&self) {
        self.connection.close(VarInt::from_u32(0), b"Session closed");
    }

    fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }
}
