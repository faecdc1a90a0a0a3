//! rustls configuration for the peer plane.
//!
//! Servers present `server.crt` and verify client certificates against
//! `ca.crt`, but accept handshakes without one so a joiner can reach `Join`.
//! Clients present `client.crt` and verify the server against `ca.crt`.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use super::certs::PemPair;
use crate::error::{DaemonError, DaemonResult};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn tls_error(err: impl std::fmt::Display) -> DaemonError {
    DaemonError::Internal(format!("tls setup failed: {err}"))
}

fn parse_certs(pem: &str, what: &str) -> DaemonResult<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DaemonError::Internal(format!("invalid {what}: {e}")))?;
    if certs.is_empty() {
        return Err(DaemonError::Internal(format!("no certificate in {what}")));
    }
    Ok(certs)
}

fn parse_key(pem: &str, what: &str) -> DaemonResult<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem.as_bytes())
        .map_err(|e| DaemonError::Internal(format!("invalid {what}: {e}")))
}

fn root_store(ca_pem: &str) -> DaemonResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(ca_pem, "ca.crt")? {
        roots.add(cert).map_err(tls_error)?;
    }
    Ok(roots)
}

/// Server side of the peer plane.
///
/// # Errors
///
/// Returns [`DaemonError::Internal`] if any PEM input is invalid.
pub fn server_config(ca_pem: &str, leaf: &PemPair) -> DaemonResult<ServerConfig> {
    let provider = provider();
    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(ca_pem)?), provider.clone())
            .allow_unauthenticated()
            .build()
            .map_err(tls_error)?;
    ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            parse_certs(&leaf.cert, "server.crt")?,
            parse_key(&leaf.key, "server.key")?,
        )
        .map_err(tls_error)
}

/// Mutually authenticated client side of the peer plane.
///
/// # Errors
///
/// Returns [`DaemonError::Internal`] if any PEM input is invalid.
pub fn client_config(ca_pem: &str, leaf: &PemPair) -> DaemonResult<ClientConfig> {
    ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_root_certificates(root_store(ca_pem)?)
        .with_client_auth_cert(
            parse_certs(&leaf.cert, "client.crt")?,
            parse_key(&leaf.key, "client.key")?,
        )
        .map_err(tls_error)
}

/// Client used for the one-shot `Join` call: no client certificate, and the
/// server certificate is accepted as presented. The cluster token is what
/// authenticates the exchange.
///
/// # Errors
///
/// Returns [`DaemonError::Internal`] if the provider rejects the protocol set.
pub fn bootstrap_client_config() -> DaemonResult<ClientConfig> {
    let provider = provider();
    Ok(ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustOnFirstUse { provider }))
        .with_no_client_auth())
}

#[derive(Debug)]
struct TrustOnFirstUse {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for TrustOnFirstUse {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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

// ---------------------------------------------------------------------------
// TlsContext
// ---------------------------------------------------------------------------

/// The currently installed peer-plane configs, swapped whenever certificates
/// are issued, re-issued or cleared.
#[derive(Debug, Default)]
pub struct TlsContext {
    server: ArcSwapOption<ServerConfig>,
    client: ArcSwapOption<ClientConfig>,
}

impl TlsContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, server: ServerConfig, client: ClientConfig) {
        self.server.store(Some(Arc::new(server)));
        self.client.store(Some(Arc::new(client)));
    }

    pub fn clear(&self) {
        self.server.store(None);
        self.client.store(None);
    }

    #[must_use]
    pub fn server(&self) -> Option<Arc<ServerConfig>> {
        self.server.load_full()
    }

    #[must_use]
    pub fn client(&self) -> Option<Arc<ClientConfig>> {
        self.client.load_full()
    }
}
