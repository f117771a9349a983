//! The authentication exchange that opens every session.
//!
//! The client opens the session's first stream and sends an [`AuthRequest`]; the server verifies
//! it, answers with an [`AuthResponse`] and closes the stream. Both ends then switch the session
//! to the cipher context named in the request. Sessions used for peer-to-peer signaling repeat the
//! exchange on every stream to poll for the peer's addresses, but only the first one rekeys.

use std::{sync::Arc, time::Duration};

use rand::{distributions::Alphanumeric, Rng};
use snova_proto::{
    auth::{AuthRequest, AuthResponse},
    message::{read_message, write_message},
    methods::{CipherMethod, CompressMethod},
};
use tokio::{io::AsyncWriteExt, time::timeout};
use tracing::{debug, warn};

use crate::{
    cipher::CipherContext,
    config::CipherConfig,
    error::{Error, Result},
    mux::MuxSession,
    p2p::rooms::RoomTable,
};

/// How long either end waits for the other's half of the exchange.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(3);

const MAX_PADDING_LEN: usize = 128;

/// What a client declares about itself when taking part in peer-to-peer rendezvous.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct P2PDeclaration {
    pub token: String,
    pub conn_id: String,
    /// Only set on signaling sessions.
    pub pri_addr: String,
    /// Overrides the public address the server observes, for symmetric NATs.
    pub pub_addr: String,
}

/// The client's side of the exchange.
#[derive(Debug, Clone)]
pub struct ClientAuth<'a> {
    pub user: &'a str,
    pub key: &'a str,
    /// The data-plane cipher to switch to; `none` for transports that encrypt on their own.
    pub method: CipherMethod,
    pub compress: CompressMethod,
    pub p2p: Option<&'a P2PDeclaration>,
}

fn random_padding() -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..MAX_PADDING_LEN);
    (&mut rng).sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}

impl<'a> ClientAuth<'a> {
    fn request(&self, counter: u64) -> AuthRequest {
        let mut request = AuthRequest {
            user: self.user.to_string(),
            cipher_counter: counter,
            cipher_method: self.method.as_str().to_string(),
            compress_method: self.compress.as_str().to_string(),
            rand: random_padding(),
            ..Default::default()
        };

        if let Some(p2p) = self.p2p {
            request.p2p_token = p2p.token.clone();
            request.p2p_conn_id = p2p.conn_id.clone();
            request.p2p_pri_addr = p2p.pri_addr.clone();
            request.p2p_pub_addr = p2p.pub_addr.clone();
        }

        request
    }

    /// Runs the exchange on a new stream of `session`. When `rekey` is set, the session switches to
    /// the negotiated cipher once the server has closed the stream.
    pub async fn run(&self, session: &MuxSession, rekey: bool) -> Result<AuthResponse> {
        let counter = rand::thread_rng().gen::<u64>();
        let request = self.request(counter);

        let mut stream = session.open_stream().await?;
        let response = match timeout(AUTH_TIMEOUT, async {
            write_message(&mut stream, &request).await?;
            read_message::<AuthResponse, _>(&mut stream).await
        })
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout("waiting for the auth response")),
        };

        if !response.is_ok() {
            return Err(Error::AuthFailed(format!("server rejected user {}", self.user)));
        }

        // The server closes the stream once it has switched ciphers.
        match timeout(AUTH_TIMEOUT, tokio::io::copy(&mut stream, &mut tokio::io::sink())).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => debug!("Session {} auth stream ended with error before rekeying: {error}", session.id()),
            Err(_) => debug!("Session {} auth stream still open after {}s, rekeying anyway", session.id(), AUTH_TIMEOUT.as_secs()),
        }
        drop(stream);

        if rekey {
            session.reset_cipher(CipherContext::new(self.method, self.key, counter));
        }

        Ok(response)
    }
}

/// The server's side of the exchange.
pub struct ServerAuth<'a> {
    pub cipher: &'a CipherConfig,
    pub rooms: &'a RoomTable,
}

/// A verified [`AuthRequest`] along with what it negotiated.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub request: AuthRequest,
    pub method: CipherMethod,
    pub compress: CompressMethod,
}

impl<'a> ServerAuth<'a> {
    fn verify(&self, request: &AuthRequest) -> Result<(CipherMethod, CompressMethod)> {
        if !self.cipher.verify_user(&request.user) {
            return Err(Error::AuthFailed(format!("user {} is not allowed", request.user)));
        }

        let compress = request
            .compress_method
            .parse::<CompressMethod>()
            .map_err(|e| Error::AuthFailed(e.to_string()))?;

        let method = request
            .cipher_method
            .parse::<CipherMethod>()
            .map_err(|e| Error::AuthFailed(e.to_string()))?;

        Ok((method, compress))
    }

    /// Accepts the next stream of `session` and runs the exchange on it. A rejected request is
    /// answered with a failure code before the error is returned. When `rekey` is set, the session
    /// switches to the negotiated cipher after the response stream is closed.
    pub async fn run(&self, session: &Arc<MuxSession>, rekey: bool) -> Result<Authenticated> {
        let mut stream = session.accept_stream().await?;
        let request = match timeout(AUTH_TIMEOUT, read_message::<AuthRequest, _>(&mut stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout("waiting for the auth request")),
        };

        let verified = self.verify(&request).and_then(|methods| {
            if request.is_p2p() {
                self.rooms.join(&request, session, session.remote_addr())?;
            }
            Ok(methods)
        });

        let (method, compress) = match verified {
            Ok(methods) => methods,
            Err(error) => {
                warn!("Rejecting session {}: {error}", session.id());
                let _ = write_message(&mut stream, &AuthResponse::failed()).await;
                let _ = stream.shutdown().await;
                return Err(error);
            }
        };

        let mut response = AuthResponse::ok();
        if request.is_p2p() {
            response.pub_addr = match (request.p2p_pub_addr.is_empty(), session.remote_addr()) {
                (false, _) => request.p2p_pub_addr.clone(),
                (true, Some(addr)) => addr.to_string(),
                (true, None) => String::new(),
            };

            if request.is_p2p_exchange() {
                if let Some((pri_addr, pub_addr)) = self.rooms.peer_addrs(&request.p2p_token, &request.p2p_conn_id) {
                    response.peer_pri_addr = pri_addr;
                    response.peer_pub_addr = pub_addr;
                }
            }
        }

        write_message(&mut stream, &response).await?;
        stream.shutdown().await?;
        drop(stream);

        if rekey {
            session.reset_cipher(CipherContext::new(method, &self.cipher.key, request.cipher_counter));
        }

        debug!(user = request.user, "Session {} authenticated with {} cipher", session.id(), method.as_str());
        Ok(Authenticated { request, method, compress })
    }
}
