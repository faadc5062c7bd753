//! Provide access to the process-global default [`CryptoProvider`] if there
//! is one, otherwise the aws-lc-rs one.

use rustls::crypto::CryptoProvider;
use std::sync::Arc;

/// Handle on the [`CryptoProvider`] that every TLS context built by this
/// crate uses.
#[derive(Clone, Debug)]
pub struct RustlsCryptoProvider(Arc<CryptoProvider>);

impl RustlsCryptoProvider {
    /// Look up the process-global default [`CryptoProvider`], falling back
    /// to aws-lc-rs if the application has not installed one.
    pub fn get() -> Self {
        Self(
            CryptoProvider::get_default()
                .cloned()
                .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider())),
        )
    }

    /// Use a specific [`CryptoProvider`].
    pub fn with_provider(provider: Arc<CryptoProvider>) -> Self {
        Self(provider)
    }

    /// The selected [`CryptoProvider`].
    pub fn crypto_provider(&self) -> Arc<CryptoProvider> {
        Arc::clone(&self.0)
    }
}

impl Default for RustlsCryptoProvider {
    fn default() -> Self {
        Self::get()
    }
}
