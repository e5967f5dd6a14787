//! Certificate hot reload.
//!
//! # States
//! ```text
//! Starting → Watching → Stopped
//! Starting → Stopped            (filesystem subscription unavailable)
//! ```
//!
//! # Design Decisions
//! - The current certificate is an immutable `CertifiedKey` behind an
//!   `ArcSwapOption`; handshakes never observe a half-replaced pair
//! - A failed load keeps whatever was loaded before (possibly nothing)
//! - A certificate whose public key does not match the private key is a
//!   failed load, so writing the two files in either order is safe
//! - Rotation via an atomically swapped symlink is detected by comparing
//!   the resolved certificate path across events
//! - Losing the subscription degrades to a static certificate, never an error

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::lifecycle::CloseSignal;
use crate::observability::metrics;

/// Error type for certificate selection and loading.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// No certificate has loaded successfully yet.
    #[error("certificate is not available")]
    Unavailable,
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no certificates found in {}", .path.display())]
    NoCertificates { path: PathBuf },
    #[error("no private key found in {}", .path.display())]
    MissingKey { path: PathBuf },
    #[error("unsupported private key: {0}")]
    UnsupportedKey(#[source] rustls::Error),
    #[error("private key {} does not match certificate: {source}", .path.display())]
    KeyMismatch {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },
    /// The filesystem change subscription could not be established.
    #[error("certificate watch failed: {0}")]
    Watch(#[from] notify::Error),
}

/// Lifecycle of the background reload loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Initial load and subscription setup.
    Starting,
    /// Reacting to filesystem events.
    Watching,
    /// Terminal. The last loaded certificate stays in effect.
    Stopped,
}

/// Owns the current certificate and keeps it in sync with the files on disk.
pub struct CertificateWatcher {
    cert_path: PathBuf,
    key_path: PathBuf,
    current: ArcSwapOption<CertifiedKey>,
    started: AtomicBool,
    closed: CloseSignal,
    state: watch::Sender<WatchState>,
    reloads: AtomicU64,
    failures: AtomicU64,
}

impl CertificateWatcher {
    /// Create a watcher without starting its background loop.
    pub fn new(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Arc<Self> {
        let (state, _) = watch::channel(WatchState::Starting);
        Arc::new(Self {
            cert_path: absolute(cert_path.as_ref()),
            key_path: absolute(key_path.as_ref()),
            current: ArcSwapOption::empty(),
            started: AtomicBool::new(false),
            closed: CloseSignal::new(),
            state,
            reloads: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    /// Create a watcher and start its background loop on the current tokio runtime.
    pub fn spawn(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Arc<Self> {
        let watcher = Self::new(cert_path, key_path);
        watcher.start();
        watcher
    }

    /// Start the background loop. Only the first call has any effect.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(Arc::clone(self).run());
    }

    /// The certificate handshakes should present right now.
    pub fn current_certificate(&self) -> Result<Arc<CertifiedKey>, CertificateError> {
        self.current.load_full().ok_or(CertificateError::Unavailable)
    }

    /// Load the certificate and key from disk and swap them in.
    ///
    /// On failure the previously loaded certificate, if any, stays in effect.
    pub async fn reload(&self) -> Result<(), CertificateError> {
        match load_certified_key(&self.cert_path, &self.key_path).await {
            Ok(key) => {
                self.current.store(Some(Arc::new(key)));
                self.reloads.fetch_add(1, Ordering::Relaxed);
                metrics::record_certificate_reload();
                tracing::info!(cert_path = %self.cert_path.display(), "Certificate loaded");
                Ok(())
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_certificate_load_failure();
                tracing::error!(
                    cert_path = %self.cert_path.display(),
                    error = %e,
                    "Failed to load certificate. Keeping current certificate."
                );
                Err(e)
            }
        }
    }

    /// Stop the background loop. Safe to call any number of times.
    ///
    /// Closing a watcher that was never started moves it straight to
    /// [`WatchState::Stopped`] and prevents a later `start`.
    pub fn close(&self) {
        if !self.closed.trigger() {
            return;
        }
        tracing::debug!(cert_path = %self.cert_path.display(), "Certificate watcher closing");
        if !self.started.swap(true, Ordering::AcqRel) {
            self.state.send_replace(WatchState::Stopped);
        }
    }

    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    /// Resolve once the background loop has reached [`WatchState::Stopped`].
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == WatchState::Stopped).await;
    }

    /// Successful loads so far.
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    /// Failed loads so far.
    pub fn load_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    async fn run(self: Arc<Self>) {
        let _ = self.reload().await;

        let (tx, mut events) = mpsc::unbounded_channel();
        let subscription = match self.subscribe(tx) {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!(
                    cert_path = %self.cert_path.display(),
                    error = %e,
                    "Certificate watch unavailable, serving a static certificate"
                );
                self.state.send_replace(WatchState::Stopped);
                return;
            }
        };

        let mut real_path = tokio::fs::canonicalize(&self.cert_path).await.ok();
        self.state.send_replace(WatchState::Watching);
        tracing::info!(cert_path = %self.cert_path.display(), "Certificate watcher started");

        loop {
            tokio::select! {
                biased;
                _ = self.closed.triggered() => break,
                Some(message) = events.recv() => match message {
                    Ok(event) => self.on_event(&event, &mut real_path).await,
                    Err(e) => tracing::warn!(error = %e, "Certificate watch error"),
                },
            }
        }

        drop(subscription);
        self.state.send_replace(WatchState::Stopped);
        tracing::debug!(cert_path = %self.cert_path.display(), "Certificate watcher stopped");
    }

    fn subscribe(
        &self,
        tx: mpsc::UnboundedSender<notify::Result<Event>>,
    ) -> Result<RecommendedWatcher, CertificateError> {
        let dir = self
            .cert_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    async fn on_event(&self, event: &Event, real_path: &mut Option<PathBuf>) {
        // A dangling path mid-rotation is re-evaluated on the next event.
        let current = match tokio::fs::canonicalize(&self.cert_path).await {
            Ok(current) => current,
            Err(e) => {
                tracing::debug!(error = %e, "Certificate path does not resolve, skipping event");
                return;
            }
        };

        let swapped = real_path.as_deref() != Some(current.as_path());
        if names_pair(event, &self.cert_path, &self.key_path) || swapped {
            *real_path = Some(current);
            let _ = self.reload().await;
        }
    }
}

impl std::fmt::Debug for CertificateWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateWatcher")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("state", &self.state())
            .field("loaded", &self.current.load().is_some())
            .finish()
    }
}

/// Whether `event` creates or writes the certificate or key file itself.
fn names_pair(event: &Event, cert_path: &Path, key_path: &Path) -> bool {
    let writes = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both))
    );
    writes
        && event
            .paths
            .iter()
            .any(|path| path == cert_path || path == key_path)
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Read and parse a PEM certificate chain and private key.
pub async fn load_certified_key(
    cert_path: &Path,
    key_path: &Path,
) -> Result<CertifiedKey, CertificateError> {
    let cert_pem = tokio::fs::read(cert_path)
        .await
        .map_err(|source| CertificateError::Read {
            path: cert_path.to_path_buf(),
            source,
        })?;
    let key_pem = tokio::fs::read(key_path)
        .await
        .map_err(|source| CertificateError::Read {
            path: key_path.to_path_buf(),
            source,
        })?;

    let chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertificateError::Parse {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if chain.is_empty() {
        return Err(CertificateError::NoCertificates {
            path: cert_path.to_path_buf(),
        });
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|source| CertificateError::Parse {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CertificateError::MissingKey {
            path: key_path.to_path_buf(),
        })?;

    let signing_key =
        rustls::crypto::ring::sign::any_supported_type(&key).map_err(CertificateError::UnsupportedKey)?;

    let certified = CertifiedKey::new(chain, signing_key);
    certified
        .keys_match()
        .map_err(|source| CertificateError::KeyMismatch {
            path: key_path.to_path_buf(),
            source,
        })?;

    Ok(certified)
}
