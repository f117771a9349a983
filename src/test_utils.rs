//! In-memory servers and networks for tests.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use snova_proto::methods::CompressMethod;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};
use url::Url;

use crate::{
    auth::ClientAuth,
    channel::Registry,
    cipher::CipherContext,
    config::{ChannelConfig, CipherConfig, ServerConfig},
    dispatch::Dispatcher,
    error::{Error, Result},
    mux::{yamux::yamux_session, MuxSession, SessionRole},
    transport::{host_port, FeatureSet, TransportChannel, TransportKind, TransportTable},
};

pub const TEST_KEY: &str = "correct horse battery staple";

fn test_cipher() -> CipherConfig {
    let mut cipher = CipherConfig {
        key: TEST_KEY.to_string(),
        ..Default::default()
    };
    cipher.adjust();
    cipher
}

/// A server with its own registry, for chains, and the dispatcher its listeners would use.
pub struct ServerFixture {
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
}

impl ServerFixture {
    pub fn start(config: ServerConfig) -> Self {
        Self::with_transports(config, TransportTable::new())
    }

    pub fn with_transports(mut config: ServerConfig, transports: TransportTable) -> Self {
        config.cipher.key = TEST_KEY.to_string();
        config.ephemeral_cipher = test_cipher();
        config.adjust();

        let registry = Registry::new(transports, config.ephemeral_cipher.clone(), None);
        let dispatcher = Arc::new(Dispatcher::new(&registry, &config));
        Self { registry, dispatcher }
    }

    /// An authenticated client session served by this fixture over an in-memory pipe.
    pub async fn client_session(&self, compress: CompressMethod) -> Arc<MuxSession> {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let remote: SocketAddr = "192.0.2.10:50000".parse().unwrap();
        let server_session = yamux_session(server, SessionRole::Server, CipherContext::bootstrap(TEST_KEY, false), None, Some(remote));
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move { dispatcher.serve_session(server_session).await });

        let session = yamux_session(client, SessionRole::Client, CipherContext::bootstrap(TEST_KEY, false), Some(remote), None);
        let cipher = test_cipher();
        let auth = ClientAuth {
            user: &cipher.user,
            key: TEST_KEY,
            method: cipher.cipher_method(),
            compress,
            p2p: None,
        };

        auth.run(&session, true).await.unwrap();
        session
    }
}

/// A dialer whose "network" is a map from `host:port` to in-process dispatchers.
pub struct MemoryNetwork {
    features: FeatureSet,
    servers: Mutex<HashMap<String, Arc<Dispatcher>>>,
    server_sessions: Mutex<Vec<Arc<MuxSession>>>,
    dials: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryNetwork {
    pub fn new(auto_expire: bool, pingable: bool) -> Arc<Self> {
        Arc::new(Self {
            features: FeatureSet { auto_expire, pingable },
            servers: Mutex::new(HashMap::new()),
            server_sessions: Mutex::new(Vec::new()),
            dials: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    pub fn add_server(&self, host_port: &str, server: &ServerFixture) {
        self.servers.lock().insert(host_port.to_string(), Arc::clone(&server.dispatcher));
    }

    /// Sessions successfully created so far.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Closes the server end of every session, as if the servers restarted.
    pub async fn close_all_server_sessions(&self) {
        let sessions = std::mem::take(&mut *self.server_sessions.lock());
        for session in sessions {
            session.close().await;
        }
    }

    pub fn transport(self: &Arc<Self>) -> Arc<dyn TransportChannel> {
        Arc::clone(self) as Arc<dyn TransportChannel>
    }

    /// A table that dials `tcp://` URLs through this network.
    pub fn table(self: &Arc<Self>) -> TransportTable {
        let mut table = TransportTable::new();
        table.register(TransportKind::Tcp, self.transport());
        table
    }
}

#[async_trait]
impl TransportChannel for MemoryNetwork {
    fn features(&self) -> FeatureSet {
        self.features
    }

    async fn create_mux_session(&self, server: &Url, config: &ChannelConfig) -> Result<Arc<MuxSession>> {
        let target = host_port(server)?;
        let dispatcher = match self.failing.load(Ordering::SeqCst) {
            true => None,
            false => self.servers.lock().get(&target).cloned(),
        };

        let Some(dispatcher) = dispatcher else {
            return Err(Error::Dial {
                server: target,
                source: std::io::ErrorKind::ConnectionRefused.into(),
            });
        };

        let (client, server_io) = tokio::io::duplex(256 * 1024);
        let client_addr: SocketAddr = "198.51.100.7:41000".parse().unwrap();
        let server_session = yamux_session(
            server_io,
            SessionRole::Server,
            CipherContext::bootstrap(dispatcher.cipher_key(), false),
            None,
            Some(client_addr),
        );
        self.server_sessions.lock().push(Arc::clone(&server_session));
        tokio::spawn(async move { dispatcher.serve_session(server_session).await });

        self.dials.fetch_add(1, Ordering::SeqCst);
        let cipher = CipherContext::bootstrap(&config.cipher.key, false);
        Ok(yamux_session(client, SessionRole::Client, cipher, Some(client_addr), None))
    }
}

/// A TCP echo server on the loopback interface.
pub async fn loopback_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}
