//! TLS for the HTTPS listener of the CA API.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{error, fmt, io};

use tokio_rustls::rustls::KeyLogFile;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

pub use tokio_rustls::rustls::ServerConfig;

//------------ Constants ----------------------------------------------------

const SSLKEYLOGFILE_ENV_VAR_NAME: &str = "SSLKEYLOGFILE";

//------------ create_server_config -----------------------------------------

/// Creates the server config from PEM files of the key and certificate
/// chain.
///
/// Clients are not authenticated on the TLS level. The API checks HMAC
/// tokens, revocation signatures and the admin token instead.
pub fn create_server_config(key_path: &Path, cert_path: &Path) -> Result<ServerConfig, TlsConfigError> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(read_certs(cert_path)?, read_key(key_path)?)
        .map_err(|err| TlsConfigError::other(ErrorKind::Tls, err))?;

    // See: https://wiki.wireshark.org/TLS#tls-decryption
    if std::env::var(SSLKEYLOGFILE_ENV_VAR_NAME).is_ok() {
        config.key_log = Arc::new(KeyLogFile::new());
    }

    Ok(config)
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let file = File::open(path).map_err(|err| TlsConfigError::new(ErrorKind::Cert(path.into()), err))?;
    let certs = rustls_pemfile::certs(&mut io::BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TlsConfigError::new(ErrorKind::Cert(path.into()), err))?;
    if certs.is_empty() {
        return Err(TlsConfigError::other(
            ErrorKind::Cert(path.into()),
            "file does not contain any certificates",
        ));
    }
    Ok(certs)
}

/// Reads the one private key in the file.
///
/// PKCS#1, PKCS#8 and SEC1 keys are accepted, other PEM items skipped.
fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    use rustls_pemfile::Item::*;

    let file = File::open(path).map_err(|err| TlsConfigError::new(ErrorKind::Key(path.into()), err))?;
    let mut key_file = io::BufReader::new(file);
    let mut key = None;

    while let Some(item) = rustls_pemfile::read_one(&mut key_file).transpose() {
        let item = item.map_err(|err| TlsConfigError::new(ErrorKind::Key(path.into()), err))?;

        let bits = match item {
            Pkcs1Key(bits) => bits.into(),
            Pkcs8Key(bits) => bits.into(),
            Sec1Key(bits) => bits.into(),
            _ => continue,
        };
        if key.is_some() {
            return Err(TlsConfigError::other(
                ErrorKind::Key(path.into()),
                "file contains multiple keys",
            ));
        }
        key = Some(bits)
    }

    key.ok_or_else(|| TlsConfigError::other(ErrorKind::Key(path.into()), "file does not contain any usable keys"))
}

//------------ TlsConfigError -----------------------------------------------

#[derive(Debug)]
pub struct TlsConfigError {
    kind: ErrorKind,
    err: io::Error,
}

#[derive(Clone, Debug)]
enum ErrorKind {
    Key(PathBuf),
    Cert(PathBuf),
    Tls,
}

impl TlsConfigError {
    fn new(kind: ErrorKind, err: io::Error) -> Self {
        Self { kind, err }
    }

    fn other(kind: ErrorKind, err: impl Into<Box<dyn error::Error + Send + Sync>>) -> Self {
        Self {
            kind,
            err: io::Error::other(err),
        }
    }
}

impl fmt::Display for TlsConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Key(ref path) => {
                write!(f, "Error in TLS key file {}: {}", path.display(), self.err)
            }
            ErrorKind::Cert(ref path) => {
                write!(f, "Error in TLS certificate file {}: {}", path.display(), self.err)
            }
            ErrorKind::Tls => write!(f, "Error in TLS configuration: {}", self.err),
        }
    }
}

impl error::Error for TlsConfigError {}

impl From<TlsConfigError> for crate::commons::error::Error {
    fn from(e: TlsConfigError) -> Self {
        crate::commons::error::Error::tls(e)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::root_key_pair_pem;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn config_from_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        let (key, cert) = root_key_pair_pem("api.meshca.local");
        let key_path = write(dir.path(), "key.pem", &key);
        let cert_path = write(dir.path(), "cert.pem", &cert);

        assert!(create_server_config(&key_path, &cert_path).is_ok());
    }

    #[test]
    fn two_keys_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (key, cert) = root_key_pair_pem("api.meshca.local");
        let (other, _) = root_key_pair_pem("other");
        let key_path = write(dir.path(), "key.pem", &format!("{}{}", key, other));
        let cert_path = write(dir.path(), "cert.pem", &cert);

        let err = create_server_config(&key_path, &cert_path).unwrap_err();
        assert!(err.to_string().contains("multiple keys"));
    }

    #[test]
    fn missing_certificate_file() {
        let dir = tempfile::tempdir().unwrap();
        let (key, _) = root_key_pair_pem("api.meshca.local");
        let key_path = write(dir.path(), "key.pem", &key);

        let err = create_server_config(&key_path, &dir.path().join("absent.pem")).unwrap_err();
        assert!(err.to_string().starts_with("Error in TLS certificate file"));
    }
}
