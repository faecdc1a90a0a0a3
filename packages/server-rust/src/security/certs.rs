//! Cluster CA and leaf certificate issuance.
//!
//! Every key is 2048-bit RSA. The CA is self-signed and kept on every member
//! so that any member can admit a joiner; leaves are issued locally.

use std::net::IpAddr;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_RSA_SHA256,
};
use time::{Duration, OffsetDateTime};

use crate::error::{DaemonError, DaemonResult};

/// Lifetime of every certificate we issue.
pub const VALIDITY_DAYS: i64 = 730;

/// A PEM certificate and its PEM private key.
#[derive(Clone, PartialEq, Eq)]
pub struct PemPair {
    pub cert: String,
    pub key: String,
}

impl std::fmt::Debug for PemPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PemPair")
            .field("cert_len", &self.cert.len())
            .finish_non_exhaustive()
    }
}

/// Which side of a TLS session a leaf authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafRole {
    Server,
    Client,
}

impl LeafRole {
    const fn common_name(self) -> &'static str {
        match self {
            Self::Server => "PulseHA Server",
            Self::Client => "PulseHA Client",
        }
    }

    const fn usage(self) -> ExtendedKeyUsagePurpose {
        match self {
            Self::Server => ExtendedKeyUsagePurpose::ServerAuth,
            Self::Client => ExtendedKeyUsagePurpose::ClientAuth,
        }
    }
}

fn crypto(err: rcgen::Error) -> DaemonError {
    DaemonError::Internal(format!("certificate generation failed: {err}"))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "PulseHA");
    dn.push(DnType::CommonName, common_name);
    dn
}

fn base_params(common_name: &str, bind_ip: IpAddr) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name);
    params.subject_alt_names = vec![SanType::IpAddress(bind_ip)];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(1);
    params.not_after = now + Duration::days(VALIDITY_DAYS);
    params
}

/// Generates the self-signed cluster CA bound to `bind_ip`.
///
/// # Errors
///
/// Returns [`DaemonError::Internal`] if key generation or signing fails.
pub fn generate_ca(bind_ip: IpAddr) -> DaemonResult<PemPair> {
    let key = KeyPair::generate_for(&PKCS_RSA_SHA256).map_err(crypto)?;
    let mut params = base_params("PulseHA CA", bind_ip);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let cert = params.self_signed(&key).map_err(crypto)?;
    Ok(PemPair {
        cert: cert.pem(),
        key: key.serialize_pem(),
    })
}

/// Issues a server or client leaf signed by `ca`.
///
/// # Errors
///
/// Returns [`DaemonError::MissingCa`] if the CA material does not parse and
/// [`DaemonError::Internal`] if signing fails.
pub fn issue_leaf(ca: &PemPair, role: LeafRole, bind_ip: IpAddr) -> DaemonResult<PemPair> {
    let ca_key = KeyPair::from_pem(&ca.key)
        .map_err(|e| DaemonError::MissingCa(format!("unreadable CA key: {e}")))?;
    let ca_params = CertificateParams::from_ca_cert_pem(&ca.cert)
        .map_err(|e| DaemonError::MissingCa(format!("unreadable CA certificate: {e}")))?;
    let ca_cert = ca_params.self_signed(&ca_key).map_err(crypto)?;

    let key = KeyPair::generate_for(&PKCS_RSA_SHA256).map_err(crypto)?;
    let mut params = base_params(role.common_name(), bind_ip);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![role.usage()];
    let cert = params.signed_by(&key, &ca_cert, &ca_key).map_err(crypto)?;
    Ok(PemPair {
        cert: cert.pem(),
        key: key.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    #[test]
    fn ca_is_pem_encoded() {
        let ca = generate_ca(loopback()).unwrap();
        assert!(ca.cert.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(ca.key.contains("PRIVATE KEY"));
    }

    #[test]
    fn leaves_are_signed_by_the_ca() {
        let ca = generate_ca(loopback()).unwrap();
        let server = issue_leaf(&ca, LeafRole::Server, loopback()).unwrap();
        let client = issue_leaf(&ca, LeafRole::Client, loopback()).unwrap();
        assert_ne!(server.cert, client.cert);
        assert_ne!(server.key, ca.key);
        assert!(server.cert.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn garbage_ca_is_reported_as_missing() {
        let bogus = PemPair {
            cert: "nope".to_string(),
            key: "nope".to_string(),
        };
        assert!(matches!(
            issue_leaf(&bogus, LeafRole::Server, loopback()),
            Err(DaemonError::MissingCa(_))
        ));
    }
}
