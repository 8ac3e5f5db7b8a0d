//! Certificate sources: local files and live TLS servers.

use log::{debug, info};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default port when an address has none.
pub const DEFAULT_TLS_PORT: u16 = 443;

/// A DER certificate and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    origin: String,
}

impl Certificate {
    /// Wrap DER bytes.
    pub fn new(der: Vec<u8>, origin: impl Into<String>) -> Self {
        Self {
            der,
            origin: origin.into(),
        }
    }

    /// DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// File path or `host:port` the certificate was read from.
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// Load certificates from a `.cer` (DER) or `.pem` (one or more blocks) file.
pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<Certificate>> {
    let path = path.as_ref();
    let origin = path.display().to_string();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "cer" => {
            let der = std::fs::read(path)?;
            Ok(vec![Certificate::new(der, origin)])
        },
        "pem" => {
            let data = std::fs::read(path)?;
            let blocks = pem::parse_many(&data)
                .map_err(|e| Error::Certificate(format!("{origin}: invalid PEM: {e}")))?;
            let certificates: Vec<_> = blocks
                .into_iter()
                .filter(|block| block.tag() == "CERTIFICATE")
                .map(|block| Certificate::new(block.into_contents(), origin.clone()))
                .collect();
            if certificates.is_empty() {
                return Err(Error::Certificate(format!(
                    "{origin}: no CERTIFICATE block found"
                )));
            }
            debug!("Loaded {} certificates from {origin}", certificates.len());
            Ok(certificates)
        },
        _ => Err(Error::Certificate(format!(
            "{origin}: unsupported certificate file extension (expected .cer or .pem)"
        ))),
    }
}

/// Split `host[:port]`, defaulting to [`DEFAULT_TLS_PORT`].
pub fn split_address(address: &str) -> Result<(String, u16)> {
    let address = address.trim();
    let address = address
        .strip_prefix("https://")
        .unwrap_or(address)
        .trim_end_matches('/');

    // `[v6]:port` or bare `[v6]`
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::Certificate(format!("unclosed bracket in {address}")))?;
        if host.is_empty() {
            return Err(Error::Certificate(format!("missing host in {address}")));
        }
        let port = match tail {
            "" => DEFAULT_TLS_PORT,
            tail => tail
                .strip_prefix(':')
                .and_then(|port| port.parse().ok())
                .ok_or_else(|| Error::Certificate(format!("invalid port in {address}")))?,
        };
        return Ok((host.to_string(), port));
    }

    // A bare IPv6 literal has several colons and no port.
    if address.matches(':').count() > 1 {
        return Ok((address.to_string(), DEFAULT_TLS_PORT));
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse()
                .map_err(|_| Error::Certificate(format!("invalid port in {address}")))?;
            Ok((host.to_string(), port))
        },
        Some(_) => Err(Error::Certificate(format!("missing host in {address}"))),
        None if !address.is_empty() => Ok((address.to_string(), DEFAULT_TLS_PORT)),
        None => Err(Error::Certificate("empty address".into())),
    }
}

/// Fetch the root of the chain presented by a TLS server.
///
/// The chain is not validated: whatever the server presents is trusted on
/// first use, and the last certificate it sends is returned.
pub fn fetch_from_host(address: &str, timeout: Duration) -> Result<Certificate> {
    let (host, port) = split_address(address)?;
    info!("Fetching certificate from {host}:{port}");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.clone())
        .map_err(|e| Error::Tls(format!("invalid server name {host}: {e}")))?;
    let mut conn = ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| Error::Tls(e.to_string()))?;

    let addr = (host.as_str(), port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Tls(format!("{host} did not resolve")))?;
    let mut socket = TcpStream::connect_timeout(&addr, timeout)?;
    socket.set_read_timeout(Some(timeout))?;
    socket.set_write_timeout(Some(timeout))?;

    while conn.is_handshaking() {
        conn.complete_io(&mut socket)
            .map_err(|e| Error::Tls(format!("handshake with {host}:{port} failed: {e}")))?;
    }

    let chain = conn
        .peer_certificates()
        .ok_or_else(|| Error::Tls(format!("{host}:{port} presented no certificates")))?;
    let root = chain
        .last()
        .ok_or_else(|| Error::Tls(format!("{host}:{port} presented an empty chain")))?;
    debug!("{host}:{port} presented {} certificates", chain.len());

    Ok(Certificate::new(root.as_ref().to_vec(), format!("{host}:{port}")))
}

/// Verifier that accepts any chain but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
