//! Where certificate material lives.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::config::persist::write_atomic;
use crate::error::DaemonResult;

/// The six PEM files a member keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertFile {
    CaCert,
    CaKey,
    ServerCert,
    ServerKey,
    ClientCert,
    ClientKey,
}

impl CertFile {
    pub const ALL: [Self; 6] = [
        Self::CaCert,
        Self::CaKey,
        Self::ServerCert,
        Self::ServerKey,
        Self::ClientCert,
        Self::ClientKey,
    ];

    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::CaCert => "ca.crt",
            Self::CaKey => "ca.key",
            Self::ServerCert => "server.crt",
            Self::ServerKey => "server.key",
            Self::ClientCert => "client.crt",
            Self::ClientKey => "client.key",
        }
    }

    #[must_use]
    pub const fn is_private_key(self) -> bool {
        matches!(self, Self::CaKey | Self::ServerKey | Self::ClientKey)
    }
}

/// Certificate file capability.
pub trait CertStore: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    fn read(&self, file: CertFile) -> DaemonResult<Option<String>>;

    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn write(&self, file: CertFile, pem: &str) -> DaemonResult<()>;

    /// # Errors
    ///
    /// Returns an error if an existing file cannot be removed.
    fn clear(&self) -> DaemonResult<()>;
}

// ---------------------------------------------------------------------------
// DiskCertStore
// ---------------------------------------------------------------------------

/// PEM files in a directory (normally `/etc/pulseha/certs`).
#[derive(Debug, Clone)]
pub struct DiskCertStore {
    dir: PathBuf,
}

impl DiskCertStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, file: CertFile) -> PathBuf {
        self.dir.join(file.file_name())
    }
}

impl CertStore for DiskCertStore {
    fn read(&self, file: CertFile) -> DaemonResult<Option<String>> {
        match fs::read_to_string(self.path(file)) {
            Ok(pem) => Ok(Some(pem)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, file: CertFile, pem: &str) -> DaemonResult<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(file);
        write_atomic(&path, pem.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if file.is_private_key() {
                fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
            }
        }
        Ok(())
    }

    fn clear(&self) -> DaemonResult<()> {
        for file in CertFile::ALL {
            match fs::remove_file(self.path(file)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryCertStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryCertStore {
    files: Mutex<HashMap<CertFile, String>>,
}

impl CertStore for MemoryCertStore {
    fn read(&self, file: CertFile) -> DaemonResult<Option<String>> {
        Ok(self.files.lock().get(&file).cloned())
    }

    fn write(&self, file: CertFile, pem: &str) -> DaemonResult<()> {
        self.files.lock().insert(file, pem.to_string());
        Ok(())
    }

    fn clear(&self) -> DaemonResult<()> {
        self.files.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_store_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCertStore::new(dir.path().join("certs"));
        assert_eq!(store.read(CertFile::CaCert).unwrap(), None);

        store.write(CertFile::CaCert, "crt").unwrap();
        store.write(CertFile::CaKey, "key").unwrap();
        assert_eq!(store.read(CertFile::CaCert).unwrap().as_deref(), Some("crt"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("certs/ca.key"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        store.clear().unwrap();
        assert_eq!(store.read(CertFile::CaKey).unwrap(), None);
    }

    #[test]
    fn file_names_match_layout() {
        let names: Vec<_> = CertFile::ALL.iter().map(|f| f.file_name()).collect();
        assert_eq!(
            names,
            ["ca.crt", "ca.key", "server.crt", "server.key", "client.crt", "client.key"]
        );
    }
}
