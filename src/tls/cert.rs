use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
    time::{Duration, SystemTime},
};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

use crate::error::CertError;

/// Certificate bundle paths plus the mtimes seen at the last (re)load.
struct CertState {
    mtimes: Vec<Option<SystemTime>>,
    last_check: Instant,
}

/// Loads cert/key/ca from disk and swaps a fresh tls acceptor in when any
/// file changes on disk. Existing connections keep the context they
/// handshook with; only new handshakes see the new certificate.
pub(crate) struct CertManager {
    cert_file: PathBuf,
    key_file: PathBuf,
    ca_file: Option<PathBuf>,
    poll: Option<Duration>,
    state: Mutex<CertState>,
    acceptor: RwLock<TlsAcceptor>,
}

impl CertManager {
    pub fn new(
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
        ca_file: Option<PathBuf>,
        poll: Option<Duration>,
    ) -> Result<Self, CertError> {
        let cert_file = cert_file.into();
        let key_file = key_file.into();

        let acceptor = build_acceptor(&cert_file, &key_file, ca_file.as_deref())?;
        let mtimes = stat_all(&cert_file, &key_file, ca_file.as_deref());

        Ok(Self {
            cert_file,
            key_file,
            ca_file,
            poll,
            state: Mutex::new(CertState {
                mtimes,
                last_check: Instant::now(),
            }),
            acceptor: RwLock::new(acceptor),
        })
    }

    /// acceptor snapshot for one handshake.
    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.read().unwrap().clone()
    }

    /// Poll file mtimes if the configured interval has elapsed; reload and
    /// swap on change. A failed reload keeps the previous bundle.
    pub async fn poll_tick(&self) {
        let Some(poll) = self.poll else { return };

        {
            let mut state = self.state.lock().unwrap();
            if state.last_check.elapsed() < poll {
                return;
            }
            state.last_check = Instant::now();
        }

        let cert_file = self.cert_file.clone();
        let key_file = self.key_file.clone();
        let ca_file = self.ca_file.clone();
        let mtimes = tokio::task::spawn_blocking(move || {
            stat_all(&cert_file, &key_file, ca_file.as_deref())
        })
        .await
        .unwrap_or_default();

        let changed = {
            let state = self.state.lock().unwrap();
            mtimes != state.mtimes
        };
        if !changed {
            return;
        }

        match build_acceptor(&self.cert_file, &self.key_file, self.ca_file.as_deref()) {
            Ok(acceptor) => {
                *self.acceptor.write().unwrap() = acceptor;
                self.state.lock().unwrap().mtimes = mtimes;
                info!(target: "cert", "reloaded tls certificate from {:?}", self.cert_file);
            }
            // keep serving with the previous bundle.
            Err(e) => error!(target: "cert", "certificate reload failed, keeping previous: {e}"),
        }
    }
}

fn stat_all(cert: &Path, key: &Path, ca: Option<&Path>) -> Vec<Option<SystemTime>> {
    let stat = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();
    let mut mtimes = vec![stat(cert), stat(key)];
    if let Some(ca) = ca {
        mtimes.push(stat(ca));
    }
    mtimes
}

fn build_acceptor(cert: &Path, key: &Path, ca: Option<&Path>) -> Result<TlsAcceptor, CertError> {
    let mut chain = read_certs(cert)?;
    if chain.is_empty() {
        return Err(CertError::Empty("certificate"));
    }
    if let Some(ca) = ca {
        chain.extend(read_certs(ca)?);
    }

    let key = read_key(key)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(std::sync::Arc::new(config)))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(CertError::from)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or(CertError::Empty("private key"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_files_error() {
        let err = CertManager::new("/nonexistent/cert.pem", "/nonexistent/key.pem", None, None);
        assert!(err.is_err());
    }
}
