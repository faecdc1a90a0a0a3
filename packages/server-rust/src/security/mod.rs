//! Cryptographic identity: cluster CA, per-node leaves, cluster token, and
//! the rustls configs built from them.

pub mod certs;
pub mod store;
pub mod tls;
pub mod token;

use std::net::IpAddr;
use std::sync::Arc;

use tracing::info;

pub use certs::{LeafRole, PemPair};
pub use store::{CertFile, CertStore, DiskCertStore, MemoryCertStore};
pub use tls::TlsContext;
pub use token::{generate_token, hash_token, verify_token};

use crate::error::{DaemonError, DaemonResult};

/// Owns the certificate files of this member.
#[derive(Clone)]
pub struct Identity {
    store: Arc<dyn CertStore>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").finish_non_exhaustive()
    }
}

impl Identity {
    #[must_use]
    pub fn new(store: Arc<dyn CertStore>) -> Self {
        Self { store }
    }

    fn required(&self, file: CertFile) -> DaemonResult<String> {
        self.store.read(file)?.ok_or_else(|| match file {
            CertFile::CaCert | CertFile::CaKey => DaemonError::MissingCa(file.file_name().to_string()),
            _ => DaemonError::Internal(format!("{} is missing", file.file_name())),
        })
    }

    /// The stored CA pair.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::MissingCa`] if either CA file is absent.
    pub fn ca(&self) -> DaemonResult<PemPair> {
        Ok(PemPair {
            cert: self.required(CertFile::CaCert)?,
            key: self.required(CertFile::CaKey)?,
        })
    }

    /// Generates and stores a new cluster CA.
    ///
    /// # Errors
    ///
    /// Returns an error if generation or writing fails.
    pub fn create_ca(&self, bind_ip: IpAddr) -> DaemonResult<()> {
        let ca = certs::generate_ca(bind_ip)?;
        self.install_ca(&ca)?;
        info!(%bind_ip, "generated cluster CA");
        Ok(())
    }

    /// Stores CA material received from a peer.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn install_ca(&self, ca: &PemPair) -> DaemonResult<()> {
        self.store.write(CertFile::CaCert, &ca.cert)?;
        self.store.write(CertFile::CaKey, &ca.key)
    }

    /// Issues and stores server and client leaves for `bind_ip`. Nothing is
    /// written unless both leaves were issued.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::MissingCa`] without a CA, or the issuing error.
    pub fn issue_leaves(&self, bind_ip: IpAddr) -> DaemonResult<()> {
        let ca = self.ca()?;
        let server = certs::issue_leaf(&ca, LeafRole::Server, bind_ip)?;
        let client = certs::issue_leaf(&ca, LeafRole::Client, bind_ip)?;
        self.store.write(CertFile::ServerCert, &server.cert)?;
        self.store.write(CertFile::ServerKey, &server.key)?;
        self.store.write(CertFile::ClientCert, &client.cert)?;
        self.store.write(CertFile::ClientKey, &client.key)?;
        info!(%bind_ip, "issued server and client certificates");
        Ok(())
    }

    /// Builds rustls configs from the stored files and installs them.
    ///
    /// # Errors
    ///
    /// Returns an error if any file is missing or invalid.
    pub fn load_into(&self, ctx: &TlsContext) -> DaemonResult<()> {
        let ca = self.required(CertFile::CaCert)?;
        let server = PemPair {
            cert: self.required(CertFile::ServerCert)?,
            key: self.required(CertFile::ServerKey)?,
        };
        let client = PemPair {
            cert: self.required(CertFile::ClientCert)?,
            key: self.required(CertFile::ClientKey)?,
        };
        ctx.install(
            tls::server_config(&ca, &server)?,
            tls::client_config(&ca, &client)?,
        );
        Ok(())
    }

    /// Removes every certificate file.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be removed.
    pub fn clear(&self) -> DaemonResult<()> {
        self.store.clear()
    }
}
