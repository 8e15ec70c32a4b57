use std::ffi::OsStr;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use prometheus_client::metrics::counter::Counter;
use rustls::ServerConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Events arriving within this window after the first one are folded into a
/// single reload, so a certificate and key written back to back are read
/// together.
const RELOAD_SETTLE: Duration = Duration::from_millis(250);

/// Kubernetes secret volumes publish updates by swapping this symlink.
const SECRET_VOLUME_DATA_LINK: &str = "..data";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read cert file '{path}': {source}")]
    CertFileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to read key file '{path}': {source}")]
    KeyFileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("no valid certificates found in '{0}'")]
    NoCerts(String),
    #[error("no valid private key found in '{0}'")]
    NoKey(String),
    #[error("unsupported private key in '{path}': {source}")]
    UnsupportedKey {
        path: String,
        source: rustls::Error,
    },
    #[error("failed to watch '{path}': {source}")]
    Watch {
        path: String,
        source: notify::Error,
    },
    #[error("certificate watcher stopped")]
    WatcherClosed,
}

pub fn load_certified_key(cert_path: &str, key_path: &str) -> Result<Arc<CertifiedKey>, TlsError> {
    let cert_data = fs::read(cert_path).map_err(|e| TlsError::CertFileRead {
        path: cert_path.to_string(),
        source: e,
    })?;
    let key_data = fs::read(key_path).map_err(|e| TlsError::KeyFileRead {
        path: key_path.to_string(),
        source: e,
    })?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_data.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertFileRead {
            path: cert_path.to_string(),
            source: e,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCerts(cert_path.to_string()));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_data.as_slice()))
        .map_err(|e| TlsError::KeyFileRead {
            path: key_path.to_string(),
            source: e,
        })?
        .ok_or_else(|| TlsError::NoKey(key_path.to_string()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| {
        TlsError::UnsupportedKey {
            path: key_path.to_string(),
            source: e,
        }
    })?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// The active server certificate. Every handshake reads it, only the
/// certificate watcher replaces it.
#[derive(Debug)]
pub struct CertStore {
    current: RwLock<Arc<CertifiedKey>>,
}

impl CertStore {
    pub fn new(initial: Arc<CertifiedKey>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    pub fn current(&self) -> Arc<CertifiedKey> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, key: Arc<CertifiedKey>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = key;
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current())
    }
}

pub fn server_config(store: Arc<CertStore>) -> Arc<ServerConfig> {
    Arc::new(
        ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(store),
    )
}

/// Reloads the key pair into `store` whenever the certificate file changes.
///
/// Only returns on failure. A reload that fails leaves the process without a
/// trustworthy identity, so callers must treat the returned error as fatal.
pub async fn watch_certificate(
    store: Arc<CertStore>,
    cert_path: String,
    key_path: String,
    reloads: Counter,
) -> TlsError {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cert_file = PathBuf::from(&cert_path);
    let watch_dir = cert_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let mut watcher = match notify::recommended_watcher(move |event: notify::Result<Event>| {
        let _ = tx.send(event);
    }) {
        Ok(w) => w,
        Err(e) => {
            return TlsError::Watch {
                path: watch_dir.display().to_string(),
                source: e,
            };
        }
    };
    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        return TlsError::Watch {
            path: watch_dir.display().to_string(),
            source: e,
        };
    }
    info!(%cert_path, dir = %watch_dir.display(), "watching certificate for changes");

    loop {
        let Some(event) = rx.recv().await else {
            return TlsError::WatcherClosed;
        };
        let relevant = match event {
            Ok(event) => touches_certificate(&event, &cert_file),
            Err(e) => {
                return TlsError::Watch {
                    path: watch_dir.display().to_string(),
                    source: e,
                };
            }
        };
        if !relevant {
            continue;
        }

        tokio::time::sleep(RELOAD_SETTLE).await;
        while rx.try_recv().is_ok() {}

        info!(%cert_path, %key_path, "certificate has been updated, reloading key pair");
        match load_certified_key(&cert_path, &key_path) {
            Ok(key) => {
                store.replace(key);
                reloads.inc();
            }
            Err(e) => return e,
        }
    }
}

fn touches_certificate(event: &Event, cert_file: &Path) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }
    debug!(kind = ?event.kind, paths = ?event.paths, "certificate directory changed");
    event.paths.iter().any(|p| {
        p.file_name() == cert_file.file_name()
            || p.file_name() == Some(OsStr::new(SECRET_VOLUME_DATA_LINK))
    })
}
