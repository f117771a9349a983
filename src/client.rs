//! The client: configured channels, their rendezvous loops and the local forward tunnels.

use std::sync::Arc;

use snova_proto::connect::ConnectRequest;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::Registry,
    config::{ClientConfig, ForwardConfig},
    error::{Error, Result},
    p2p::{PortMapper, Rendezvous},
    relay,
    transport::TransportTable,
};

/// Accepts local connections for one forward tunnel and relays each through its channel, until
/// `shutdown` is cancelled.
pub async fn run_forward(listener: TcpListener, registry: Arc<Registry>, forward: Arc<ForwardConfig>, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(listen = %addr, channel = forward.channel, "Forwarding to {}", forward.target);
    }

    loop {
        let accepted = select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (socket, from) = match accepted {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!("Failed to accept a forwarded connection: {error}");
                continue;
            }
        };

        let registry = Arc::clone(&registry);
        let forward = Arc::clone(&forward);
        tokio::spawn(async move {
            if let Err(error) = forward_connection(socket, &registry, &forward).await {
                debug!(channel = forward.channel, "Forwarded connection from {from} ended with error: {error}");
            }
        });
    }
}

async fn forward_connection(socket: TcpStream, registry: &Registry, forward: &ForwardConfig) -> Result<()> {
    let _ = socket.set_nodelay(true);
    let request = ConnectRequest::new("tcp", forward.target.clone());
    let stream = registry.open_connected_stream(&forward.channel, request).await?;
    let (sent, received) = relay::splice(socket, stream, None).await?;
    debug!(channel = forward.channel, "Forward to {} done, {sent} bytes sent and {received} received", forward.target);
    Ok(())
}

pub struct Client {
    registry: Arc<Registry>,
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig, transports: TransportTable, port_mapper: Option<Arc<dyn PortMapper>>) -> Self {
        let registry = Registry::new(transports, config.ephemeral_cipher.clone(), port_mapper);
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Registers and connects every enabled channel. Channels that fail to connect stay
    /// registered and are retried on demand.
    pub async fn init_channels(&self) {
        for channel in self.config.channels.iter().filter(|channel| channel.enable) {
            if let Err(error) = self.registry.init_channel(channel.clone()).await {
                warn!(channel = channel.name, "Channel not connected yet: {error}");
            }
        }
    }

    fn start_rendezvous(&self, shutdown: &CancellationToken) {
        for channel in self.config.channels.iter().filter(|channel| channel.enable && channel.is_p2p()) {
            let Some(proxy_channel) = self.registry.get_channel(&channel.name) else {
                continue;
            };

            for server in &channel.servers {
                match Rendezvous::new(Arc::clone(&self.registry), Arc::clone(&proxy_channel), server, self.config.upnp_expose_port) {
                    Ok(rendezvous) => {
                        tokio::spawn(rendezvous.run(shutdown.child_token()));
                    }
                    Err(error) => warn!(channel = channel.name, "No rendezvous through {server}: {error}"),
                }
            }
        }
    }

    async fn bind_forwards(&self) -> Result<Vec<(TcpListener, Arc<ForwardConfig>)>> {
        let mut listeners = Vec::with_capacity(self.config.forwards.len());
        for forward in &self.config.forwards {
            let listener = TcpListener::bind(&forward.listen)
                .await
                .map_err(|error| Error::Config(format!("Failed to listen on {}: {error}", forward.listen)))?;
            listeners.push((listener, Arc::new(forward.clone())));
        }

        Ok(listeners)
    }

    /// Runs until `shutdown` is cancelled, then stops every channel.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let forwards = self.bind_forwards().await?;

        self.init_channels().await;
        self.registry.start_reaper();
        tokio::spawn(Arc::clone(&self.registry).run_stats_logger(shutdown.child_token()));
        self.start_rendezvous(&shutdown);

        let mut handles = Vec::with_capacity(forwards.len());
        for (listener, forward) in forwards {
            let registry = Arc::clone(&self.registry);
            handles.push(tokio::spawn(run_forward(listener, registry, forward, shutdown.child_token())));
        }

        shutdown.cancelled().await;
        info!("Client shutting down");
        for handle in handles {
            let _ = handle.await;
        }

        self.registry.stop_all().await;
        Ok(())
    }
}
