use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        Mutex,
    },
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tokio_yamux::{session::SessionType, Config as YamuxConfig, Control, Session, StreamHandle};
use tracing::{debug, warn};

use super::{AsyncStream, MuxSession, RawMux, RawStream, SessionRole};
use crate::{
    cipher::CipherContext,
    error::{Error, Result},
};

/// Streams accepted by the multiplexer but not yet taken by [`MuxSession::accept_stream`].
const ACCEPT_BACKLOG: usize = 256;

struct YamuxMux {
    control: Mutex<Control>,
    incoming: Mutex<mpsc::Receiver<StreamHandle>>,
    shutdown: CancellationToken,
}

/// Runs a yamux session over `io`, driving it from a background task until the session ends or
/// is closed.
pub fn yamux_session<T>(io: T, role: SessionRole, cipher: CipherContext, local_addr: Option<SocketAddr>, remote_addr: Option<SocketAddr>) -> Arc<MuxSession>
where
    T: AsyncStream + 'static,
{
    yamux_session_with_backlog(io, role, cipher, local_addr, remote_addr, ACCEPT_BACKLOG)
}

/// Closes a stream nobody will accept, so the peer sees it end instead of waiting on it.
fn refuse_stream(mut stream: StreamHandle) {
    tokio::spawn(async move {
        let _ = timeout(Duration::from_secs(1), stream.shutdown()).await;
    });
}

fn yamux_session_with_backlog<T>(
    io: T,
    role: SessionRole,
    cipher: CipherContext,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    backlog: usize,
) -> Arc<MuxSession>
where
    T: AsyncStream + 'static,
{
    let session_type = match role {
        SessionRole::Client => SessionType::Client,
        SessionRole::Server => SessionType::Server,
    };

    let mut session = Session::new(io, YamuxConfig::default(), session_type);
    let control = session.control();
    let (incoming_tx, incoming_rx) = mpsc::channel(backlog);
    let shutdown = CancellationToken::new();

    let driver_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            let next = select! {
                biased;
                _ = driver_shutdown.cancelled() => break,
                next = session.next() => next,
            };

            match next {
                Some(Ok(stream)) => match incoming_tx.try_send(stream) {
                    Ok(()) => {}
                    Err(TrySendError::Full(stream)) => {
                        warn!("Refusing incoming yamux stream {}, {backlog} streams already waiting to be accepted", stream.id());
                        refuse_stream(stream);
                    }
                    Err(TrySendError::Closed(stream)) => {
                        debug!("Refusing incoming yamux stream {}, the session no longer accepts streams", stream.id());
                        refuse_stream(stream);
                    }
                },
                Some(Err(error)) => {
                    debug!("Yamux session ended with error: {error}");
                    break;
                }
                None => break,
            }
        }

        driver_shutdown.cancel();
    });

    let mux = YamuxMux {
        control: Mutex::new(control),
        incoming: Mutex::new(incoming_rx),
        shutdown,
    };

    MuxSession::new(mux, cipher, local_addr, remote_addr)
}

#[async_trait]
impl RawMux for YamuxMux {
    async fn open(&self) -> Result<RawStream> {
        if self.shutdown.is_cancelled() {
            return Err(Error::SessionShutdown);
        }

        let result = {
            let mut control = self.control.lock().await;
            control.open_stream().await
        };

        match result {
            Ok(stream) => Ok(RawStream {
                id: stream.id() as u64,
                io: Box::new(stream),
            }),
            Err(error) => {
                debug!("Failed to open yamux stream: {error}");
                Err(Error::SessionShutdown)
            }
        }
    }

    async fn accept(&self) -> Result<RawStream> {
        let mut incoming = self.incoming.lock().await;
        let stream = select! {
            biased;
            stream = incoming.recv() => stream,
            _ = self.shutdown.cancelled() => None,
        };

        match stream {
            Some(stream) => Ok(RawStream {
                id: stream.id() as u64,
                io: Box::new(stream),
            }),
            None => Err(Error::SessionShutdown),
        }
    }

    async fn close(&self) {
        {
            let mut control = self.control.lock().await;
            let _ = timeout(Duration::from_secs(1), control.close()).await;
        }

        self.shutdown.cancel();
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_streams_over_backlog_are_closed() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = yamux_session(a, SessionRole::Client, CipherContext::none(), None, None);
        let _server = yamux_session_with_backlog(b, SessionRole::Server, CipherContext::none(), None, None, 1);

        let mut waiting = client.open_stream().await.unwrap();
        waiting.write_all(b"first").await.unwrap();
        waiting.flush().await.unwrap();
        let mut refused = client.open_stream().await.unwrap();
        refused.write_all(b"second").await.unwrap();
        refused.flush().await.unwrap();

        // Nobody accepts on the server, so the second stream doesn't fit in the backlog.
        let mut buf = [0u8; 8];
        let read = timeout(Duration::from_secs(5), refused.read(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))));
    }

    #[tokio::test]
    async fn test_accepted_stream_carries_bytes() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = yamux_session(a, SessionRole::Client, CipherContext::none(), None, None);
        let server = yamux_session(b, SessionRole::Server, CipherContext::none(), None, None);

        let mut outbound = client.open_stream().await.unwrap();
        outbound.write_all(b"ping").await.unwrap();
        outbound.flush().await.unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(server.num_streams(), 1);
    }
}
