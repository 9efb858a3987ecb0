//! Protocol engine boundary
//!
//! The session delegates the actual handshake with the remote endpoint to a
//! [`ProtocolEngine`]. The trait is the integration point for a full
//! protocol implementation; the [`TlsProbeEngine`] shipped here performs a
//! real transport handshake (TCP connect plus TLS against the webpki roots)
//! and hands credential acceptance to a pluggable [`CredentialVerifier`]
//! for diagnostic/offline use.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("operation timed out")]
    Timeout,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("credentials rejected: {0}")]
    Auth(String),
    #[error("not connected")]
    NotConnected,
}

/// Handshake and credential verification against the remote endpoint
///
/// Implementations own whatever transport state the protocol needs; the
/// session only drives the three lifecycle calls and never inspects the
/// connection itself.
pub trait ProtocolEngine: Send {
    fn connect(&mut self, hostname: &str, port: u16) -> Result<(), EngineError>;
    fn authenticate(&mut self, username: &str, password: &str) -> Result<(), EngineError>;
    fn disconnect(&mut self);
}

/// Credential acceptance for diagnostic/offline modes
///
/// A real deployment verifies credentials inside the protocol handshake;
/// these verifiers exist so the engine boundary stays testable without a
/// live server.
pub trait CredentialVerifier: Send {
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// Safe default: no credential is ever accepted offline
pub struct RejectAll;

impl CredentialVerifier for RejectAll {
    fn verify(&self, _username: &str, _password: &str) -> bool {
        false
    }
}

/// Offline diagnostic rule: both credentials must reach a minimum length
pub struct MinLength(pub usize);

impl CredentialVerifier for MinLength {
    fn verify(&self, username: &str, password: &str) -> bool {
        username.len() >= self.0 && password.len() >= self.0
    }
}

/// Transport-level engine: resolves, connects with a deadline and completes
/// a TLS handshake, which validates the server identity against the webpki
/// roots. Credential checks go through the configured verifier.
pub struct TlsProbeEngine {
    hub: String,
    timeout: Duration,
    verifier: Box<dyn CredentialVerifier>,
    stream: Option<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>,
}

impl TlsProbeEngine {
    pub fn new(hub: String, timeout: Duration, verifier: Box<dyn CredentialVerifier>) -> Self {
        Self {
            hub,
            timeout,
            verifier,
            stream: None,
        }
    }

    /// Hub/realm identifier this engine presents to the server
    pub fn hub(&self) -> &str {
        &self.hub
    }

    fn resolve(hostname: &str, port: u16) -> Result<SocketAddr, EngineError> {
        let mut addrs = (hostname, port)
            .to_socket_addrs()
            .map_err(|e| EngineError::Handshake(format!("failed to resolve {hostname}: {e}")))?;
        addrs
            .next()
            .ok_or_else(|| EngineError::Handshake(format!("no addresses found for {hostname}")))
    }

    fn tls_connect(
        &self,
        hostname: &str,
        addr: SocketAddr,
    ) -> Result<rustls::StreamOwned<rustls::ClientConnection, TcpStream>, EngineError> {
        let tcp = TcpStream::connect_timeout(&addr, self.timeout).map_err(map_io)?;
        tcp.set_read_timeout(Some(self.timeout)).map_err(map_io)?;
        tcp.set_write_timeout(Some(self.timeout)).map_err(map_io)?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let server_name = rustls::pki_types::ServerName::try_from(hostname.to_string())
            .map_err(|e| EngineError::Handshake(format!("invalid server name: {e}")))?;
        let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| EngineError::Handshake(e.to_string()))?;

        let mut tcp = tcp;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp).map_err(map_io)?;
        }
        debug!("TLS handshake with {} completed", hostname);

        Ok(rustls::StreamOwned::new(conn, tcp))
    }
}

fn map_io(e: io::Error) -> EngineError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => EngineError::Timeout,
        _ => EngineError::Handshake(e.to_string()),
    }
}

impl ProtocolEngine for TlsProbeEngine {
    fn connect(&mut self, hostname: &str, port: u16) -> Result<(), EngineError> {
        let addr = Self::resolve(hostname, port)?;
        info!("Connecting to {}:{} (hub {})", hostname, port, self.hub);
        let stream = self.tls_connect(hostname, addr)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn authenticate(&mut self, username: &str, password: &str) -> Result<(), EngineError> {
        if self.stream.is_none() {
            return Err(EngineError::NotConnected);
        }
        if self.verifier.verify(username, password) {
            info!("Credentials accepted for {}", username);
            Ok(())
        } else {
            warn!("Credentials rejected for {}", username);
            Err(EngineError::Auth(
                "verifier rejected the credentials".to_string(),
            ))
        }
    }

    fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.conn.send_close_notify();
            let _ = stream.sock.shutdown(Shutdown::Both);
            debug!("Engine transport closed");
        }
    }
}
