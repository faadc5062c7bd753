//! Bundles backed by PEM files on disk.
//!
//! Each of the "remote" and "self" bundles is read from a private key file,
//! a certificate chain file and optionally a trust anchor file. The files
//! are checked periodically, and when any of them changed (by size or
//! modification time) the bundle is reloaded and an update published.
//!
//! # Command line flags
//!
//! | Flag                            | Default | Meaning                 |
//! |---------------------------------|---------|-------------------------|
//! | `--remote-key-path`             | None    | Name of file containing PEM-format X.509 private key for outbound mTLS |
//! | `--remote-cert-path`            | None    | Name of file containing PEM-format X.509 certificate(s) for outbound mTLS |
//! | `--remote-cacert`               | None    | Name of file containing PEM-format X.509 trust anchor certificate(s) for verifying servers |
//! | `--self-key-path`               | None    | Name of file containing PEM-format X.509 private key for inbound mTLS |
//! | `--self-cert-path`              | None    | Name of file containing PEM-format X.509 certificate(s) for inbound mTLS |
//! | `--self-cacert`                 | None    | Name of file containing PEM-format X.509 trust anchor certificate(s) for verifying clients |
//! | `--bundle-reload-interval-secs` | 900     | How often to check the files for changes |
use async_stream::stream;
use futures::{Stream, StreamExt};
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::bundle::{BundleMaterial, Bundles, KeyEntry};
use crate::{Error, REMOTE_BUNDLE, SELF_BUNDLE};

const RELOAD_INTERVAL_SECS: u64 = 900;

/// Command line arguments for [`FileBundleSource`]. These are all
/// pathnames to files on disk.
#[derive(clap::Args, Debug)]
#[group(id = "tls_hot_reload_files_args")]
pub struct Args {
    #[arg(
        long,
        help = "Path to TLS key in PEM format for outbound mTLS. If unset, the \"remote\" bundle is not loaded."
    )]
    remote_key_path: Option<PathBuf>,

    #[arg(
        long,
        help = "Path to TLS certificate in PEM format for outbound mTLS. If unset, the \"remote\" bundle is not loaded."
    )]
    remote_cert_path: Option<PathBuf>,

    #[arg(
        long,
        help = "Path to TLS root certificate for verifying servers, in PEM format."
    )]
    remote_cacert: Option<PathBuf>,

    #[arg(
        long,
        help = "Path to TLS key in PEM format for inbound mTLS. If unset, the \"self\" bundle is not loaded."
    )]
    self_key_path: Option<PathBuf>,

    #[arg(
        long,
        help = "Path to TLS certificate in PEM format for inbound mTLS. If unset, the \"self\" bundle is not loaded."
    )]
    self_cert_path: Option<PathBuf>,

    #[arg(
        long,
        help = "Path to TLS root certificate for verifying clients, in PEM format."
    )]
    self_cacert: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = RELOAD_INTERVAL_SECS,
        help = "How often to check TLS files for changes, in seconds."
    )]
    bundle_reload_interval_secs: u64,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            remote_key_path: None,
            remote_cert_path: None,
            remote_cacert: None,
            self_key_path: None,
            self_cert_path: None,
            self_cacert: None,
            bundle_reload_interval_secs: RELOAD_INTERVAL_SECS,
        }
    }
}

#[derive(Default)]
struct Sentinels {
    key_sentinel: Option<(u64, SystemTime)>,
    cert_sentinel: Option<(u64, SystemTime)>,
    cacert_sentinel: Option<(u64, SystemTime)>,
}

struct Loader {
    name: &'static str,
    key_path: PathBuf,
    cert_path: PathBuf,
    cacert_path: Option<PathBuf>,
    sentinels: Sentinels,
}

fn reload_sentinel(md: std::io::Result<std::fs::Metadata>) -> Option<(u64, SystemTime)> {
    md.ok().and_then(|m| Some((m.len(), m.modified().ok()?)))
}

fn sentinel_mismatch(old: &Option<(u64, SystemTime)>, path: &Path) -> bool {
    match old {
        None => true,
        Some(old_md) => match reload_sentinel(path.metadata()) {
            None => true,
            Some(ref new_md) => old_md != new_md,
        },
    }
}

fn read_file(path: &Path) -> std::io::Result<(Vec<u8>, Option<(u64, SystemTime)>)> {
    let mut file = File::open(path)?;
    let sentinel = reload_sentinel(file.metadata());
    let mut pem = Vec::new();
    file.read_to_end(&mut pem)?;
    Ok((pem, sentinel))
}

impl Loader {
    fn new(
        name: &'static str,
        key_path: Option<PathBuf>,
        cert_path: Option<PathBuf>,
        cacert_path: Option<PathBuf>,
    ) -> Result<Option<Self>, Error> {
        match (key_path, cert_path) {
            (Some(key_path), Some(cert_path)) => Ok(Some(Self {
                name,
                key_path,
                cert_path,
                cacert_path,
                sentinels: Sentinels::default(),
            })),
            (None, None) => Ok(None),
            _ => Err(Error::NoTlsFlags(name)),
        }
    }

    fn load_files(&mut self) -> std::io::Result<BundleMaterial> {
        let (key_pem, key_sentinel) = read_file(&self.key_path)?;
        let key = rustls_pemfile::private_key(&mut Cursor::new(&key_pem))?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no private key found in {}", self.key_path.display()),
            )
        })?;

        let (cert_pem, cert_sentinel) = read_file(&self.cert_path)?;
        let cert =
            rustls_pemfile::certs(&mut Cursor::new(&cert_pem)).collect::<Result<Vec<_>, _>>()?;
        if cert.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no certificates found in {}", self.cert_path.display()),
            ));
        }

        let (cacert, cacert_sentinel) = if let Some(ref path) = self.cacert_path {
            let (cacert_pem, sentinel) = read_file(path)?;
            let cacert = rustls_pemfile::certs(&mut Cursor::new(&cacert_pem))
                .collect::<Result<Vec<_>, _>>()?;
            if cacert.is_empty() {
                log::warn!("No root certificates loaded from file {}", path.display());
            }
            (cacert, sentinel)
        } else {
            (Vec::new(), None)
        };

        self.sentinels = Sentinels {
            key_sentinel,
            cert_sentinel,
            cacert_sentinel,
        };
        Ok(BundleMaterial {
            key_material: vec![KeyEntry::new(self.name, key, cert)],
            trust_material: cacert,
        })
    }

    fn needs_reload(&self) -> bool {
        sentinel_mismatch(&self.sentinels.key_sentinel, &self.key_path)
            || sentinel_mismatch(&self.sentinels.cert_sentinel, &self.cert_path)
            || self
                .cacert_path
                .as_ref()
                .map(|p| sentinel_mismatch(&self.sentinels.cacert_sentinel, p))
                .unwrap_or(false)
    }

    fn try_reload(&mut self) -> Option<BundleMaterial> {
        if !self.needs_reload() {
            return None;
        }
        match self.load_files() {
            Ok(material) => Some(material),
            Err(e) => {
                if let Some(ref path) = self.cacert_path {
                    log::warn!(
                        "Could not reload TLS bundle {} from {}, {}, and {}: {}",
                        self.name,
                        self.key_path.display(),
                        self.cert_path.display(),
                        path.display(),
                        e
                    );
                } else {
                    log::warn!(
                        "Could not reload TLS bundle {} from {} and {}: {}",
                        self.name,
                        self.key_path.display(),
                        self.cert_path.display(),
                        e
                    );
                }
                None
            }
        }
    }
}

/// Loads bundles from PEM files and reloads them when the files change.
pub struct FileBundleSource {
    loaders: Vec<Loader>,
    interval: Duration,
}

impl std::fmt::Debug for FileBundleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("FileBundleSource")
            .field("bundles", &self.bundle_names().collect::<Vec<_>>())
            .field("interval", &self.interval)
            .finish()
    }
}

impl FileBundleSource {
    /// Configure from command line flags. A bundle is configured if both
    /// its key and cert paths are given and skipped if neither is.
    pub fn new(args: Args) -> Result<Self, Error> {
        let loaders = [
            Loader::new(
                REMOTE_BUNDLE,
                args.remote_key_path,
                args.remote_cert_path,
                args.remote_cacert,
            )?,
            Loader::new(
                SELF_BUNDLE,
                args.self_key_path,
                args.self_cert_path,
                args.self_cacert,
            )?,
        ]
        .into_iter()
        .flatten()
        .collect();
        Ok(Self {
            loaders,
            interval: Duration::from_secs(args.bundle_reload_interval_secs),
        })
    }

    /// Names of the bundles this source provides.
    pub fn bundle_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.loaders.iter().map(|l| l.name)
    }

    /// Read every configured bundle and register it in `bundles`.
    pub fn load(&mut self, bundles: &Bundles) -> Result<(), Error> {
        for loader in self.loaders.iter_mut() {
            let material = loader.load_files()?;
            let bundle = bundles.insert(loader.name, material)?;
            log::info!(
                "Loaded TLS bundle {} from {}",
                bundle.name(),
                loader.cert_path.display()
            );
        }
        Ok(())
    }

    fn reload_loop(self) -> impl Stream<Item = (&'static str, BundleMaterial)> {
        let Self {
            mut loaders,
            interval,
        } = self;
        stream! {
            loop {
                tokio::time::sleep(interval).await;
                for loader in loaders.iter_mut() {
                    if let Some(material) = loader.try_reload() {
                        yield (loader.name, material);
                    }
                }
            }
        }
    }

    /// Check the files forever, publishing changed bundles to `bundles`.
    /// Call [`FileBundleSource::load`] first.
    pub async fn run(self, bundles: Arc<Bundles>) {
        let mut updates = pin!(self.reload_loop());
        while let Some((name, material)) = updates.next().await {
            if let Err(e) = bundles.update(name, material) {
                log::warn!("Could not publish reloaded TLS bundle {}: {}", name, e);
            }
        }
    }
}
