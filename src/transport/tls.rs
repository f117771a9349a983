//! Certificates and rustls configurations shared by the TLS and QUIC transports.
//!
//! Servers present a freshly generated self-signed certificate and clients don't verify it: the
//! authentication that matters happens inside the session, with the shared cipher key.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rustls::{Certificate, PrivateKey};
use url::{Host, Url};

use crate::error::{Error, Result};

pub fn generate_self_signed(names: Vec<String>) -> Result<(Vec<Certificate>, PrivateKey)> {
    let cert = rcgen::generate_simple_self_signed(names).map_err(|e| Error::Config(format!("Failed to generate certificate: {e}")))?;
    let cert_der = cert.serialize_der().map_err(|e| Error::Config(format!("Failed to serialize certificate: {e}")))?;
    let priv_key = PrivateKey(cert.serialize_private_key_der());
    Ok((vec![Certificate(cert_der)], priv_key))
}

/// The name to present during the handshake: a random configured SNI override, or the server's
/// host.
pub fn server_name(server: &Url, sni: &[String]) -> String {
    if let Some(name) = sni.choose(&mut rand::thread_rng()) {
        return name.clone();
    }

    match server.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => "localhost".to_string(),
    }
}

pub fn client_crypto() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth()
}

pub fn server_crypto() -> Result<rustls::ServerConfig> {
    let (cert_chain, priv_key) = generate_self_signed(vec!["localhost".into()])?;
    let crypto = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, priv_key)?;

    Ok(crypto)
}

struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
