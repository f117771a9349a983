//! Gateway port mapping, as an injected capability.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Result;

pub const MAPPING_TAG: &str = "snova_p2p";

/// Something that can ask the local gateway to forward a TCP port to this host, such as a UPnP
/// client.
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// Maps `port` on the gateway to the same port on this host and returns the gateway's
    /// external address.
    async fn forward(&self, port: u16, tag: &str) -> Result<IpAddr>;

    async fn clear(&self, port: u16) -> Result<()>;
}

/// A live mapping. Must be released explicitly.
pub struct PortMapping {
    mapper: Arc<dyn PortMapper>,
    port: u16,
    external: IpAddr,
}

impl PortMapping {
    pub async fn open(mapper: &Arc<dyn PortMapper>, port: u16) -> Result<Self> {
        let external = mapper.forward(port, MAPPING_TAG).await?;
        info!("Gateway maps {external}:{port} to local port {port}");
        Ok(Self {
            mapper: Arc::clone(mapper),
            port,
            external,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn external_addr(&self) -> SocketAddr {
        SocketAddr::new(self.external, self.port)
    }

    pub async fn release(self) {
        if let Err(error) = self.mapper.clear(self.port).await {
            warn!("Failed to clear the mapping of port {}: {error}", self.port);
        }
    }
}
