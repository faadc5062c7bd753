//! Live rotation of TLS credentials for HTTP clients and servers.
//!
//! Long-running services that talk mutual TLS need to pick up renewed keys,
//! certificates and trust anchors without restarting. This crate keeps
//! named credential [`Bundle`]s in a [`Bundles`] registry, notices when a
//! bundle changes, and rebuilds every TLS-dependent object derived from it
//! exactly once per change, swapping the new instance in atomically while
//! the old one keeps serving until the swap.
//!
//! Every certificate chain that goes through a handshake, whether presented
//! by us or validated from the peer, is handed to a [`ChainSink`] (by
//! default [`LogSink`], which writes one log record per certificate) without
//! altering the outcome of the handshake.
//!
//! The moving parts, leaves first:
//!
//! * [`bundle`]: immutable, versioned snapshots of key and trust material
//!   and the registry that publishes new versions.
//! * [`files`]: a backing source that reloads bundles from PEM files when
//!   they change on disk.
//! * [`observe`]: the chain-observing key selector and trust validator.
//! * [`context`]: turns one bundle version into a rustls client or server
//!   configuration.
//! * [`watcher`]: delivers bundle change notifications to callbacks.
//! * [`reloader`]: owns a dependent object and replaces it on change.
//! * [`client`] and [`server`]: the two dependent objects this crate
//!   ships, an outbound HTTP client and an inbound HTTPS listener.
//!
//! ```
//! use std::sync::Arc;
//! use tls_hot_reload::{Bundles, BundleWatcher, ContextBuilder, RustlsCryptoProvider};
//!
//! # fn demo(material: tls_hot_reload::bundle::BundleMaterial) -> Result<(), tls_hot_reload::Error> {
//! let bundles = Arc::new(Bundles::new());
//! let remote = bundles.insert("remote", material)?;
//! let builder = ContextBuilder::new(RustlsCryptoProvider::get().crypto_provider());
//! let context = builder.build_client(&remote)?;
//! assert_eq!(context.version(), 1);
//!
//! // Somewhere with a tokio runtime:
//! // tokio::spawn(BundleWatcher::new(Arc::clone(&bundles)).run());
//! # Ok(())
//! # }
//! ```
//!
//! # Feature Flags
//!
//! - `files` (default): [`files::FileBundleSource`], PEM files on disk.
//! - `client` (default): [`client::OutboundClient`] built on `reqwest`.
//! - `server` (default): [`server::InboundTls`] built on `axum-server`.

#![warn(missing_docs)]

pub mod bundle;
#[cfg(feature = "client")]
pub mod client;
pub mod context;
pub mod crypto_provider;
#[cfg(feature = "files")]
pub mod files;
pub mod observe;
pub mod reloader;
#[cfg(feature = "server")]
pub mod server;
pub mod watcher;

#[cfg(test)]
mod testdata;
#[cfg(test)]
mod testutil;

pub use bundle::{Bundle, Bundles, KeyEntry};
pub use context::{
    ClientAuthDisabled, ClientAuthEnabled, ClientContext, ContextBuilder, Observe, ServerContext,
    TlsContext,
};
pub use crypto_provider::RustlsCryptoProvider;
pub use observe::key_selector::{KeySelector, ObservingKeySelector};
pub use observe::trust::{ObservingTrustValidator, TrustValidationError, TrustValidator};
pub use observe::{ChainSink, Direction, LogSink};
pub use reloader::{DependentFactory, Reloader};
pub use watcher::BundleWatcher;

use thiserror::Error;

/// Name of the bundle holding credentials for outbound mTLS.
pub const REMOTE_BUNDLE: &str = "remote";

/// Name of the bundle holding credentials for inbound mTLS.
pub const SELF_BUNDLE: &str = "self";

/// Error type returned by tls_hot_reload functions
#[derive(Debug, Error)]
pub enum Error {
    /// No bundle is registered under this name.
    #[error("no TLS bundle named {0:?}")]
    BundleNotFound(String),
    /// A bundle is already registered under this name.
    #[error("a TLS bundle named {0:?} already exists")]
    DuplicateBundle(String),
    /// The crypto provider cannot supply what the TLS context needs.
    #[error("cannot initialise TLS context: {0}")]
    ContextInitialization(#[source] rustls::Error),
    /// The key or trust material in a bundle was rejected while
    /// building a TLS context from it.
    #[error("TLS bundle {bundle:?} has unusable key material: {reason}")]
    KeyMaterial {
        /// Bundle whose material was rejected.
        bundle: String,
        /// What was wrong with it.
        reason: String,
    },
    /// A bundle change callback failed.
    #[error("change callback for TLS bundle {bundle:?} failed: {source}")]
    Callback {
        /// Bundle whose change was being delivered.
        bundle: String,
        /// What the callback reported.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A bundle is half-configured on the command line.
    #[error("TLS bundle {0:?} needs both a key path and a cert path")]
    NoTlsFlags(&'static str),
    /// Wrapper for std::io::Error
    #[error("{0}")]
    IOError(#[from] std::io::Error),
    /// Wrapper for reqwest::Error
    #[cfg(feature = "client")]
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    /// A URL could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl Error {
    pub(crate) fn key_material(bundle: &Bundle, reason: impl std::fmt::Display) -> Self {
        Self::KeyMaterial {
            bundle: bundle.name().to_owned(),
            reason: reason.to_string(),
        }
    }
}

/// Command line flags for everything in this crate.
///
/// This struct is meant to be flattened into an application's
/// [clap](https://crates.io/crates/clap) parser.
///
/// | Flag                            | Default | Meaning |
/// |---------------------------------|---------|---------|
/// | `--remote-key-path`             | *none*  | PEM private key for outbound mTLS |
/// | `--remote-cert-path`            | *none*  | PEM certificate chain for outbound mTLS |
/// | `--remote-cacert`               | *none*  | PEM trust anchors for verifying servers |
/// | `--self-key-path`               | *none*  | PEM private key for inbound mTLS |
/// | `--self-cert-path`              | *none*  | PEM certificate chain for inbound mTLS |
/// | `--self-cacert`                 | *none*  | PEM trust anchors for verifying clients |
/// | `--bundle-reload-interval-secs` | `900`   | How often to look for changed files |
/// | `--remote-url`                  | *none*  | Base URL for the outbound client |
/// | `--https-port`                  | *none*  | Inbound HTTPS port. If unset, nothing is served. |
/// | `--https-bind-addr`             | `::`    | Inbound HTTPS bind address |
/// | `--server-hot-reload`           | `true`  | Rebuild the listener's TLS when "self" changes |
#[derive(clap::Args, Debug)]
#[group(id = "tls_hot_reload_args")]
pub struct Args {
    #[cfg(feature = "files")]
    #[command(flatten)]
    #[allow(missing_docs)]
    pub files: files::Args,

    #[cfg(feature = "client")]
    #[command(flatten)]
    #[allow(missing_docs)]
    pub client: client::Args,

    #[cfg(feature = "server")]
    #[command(flatten)]
    #[allow(missing_docs)]
    pub server: server::Args,
}
