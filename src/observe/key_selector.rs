//! Selection of the local identity to present in a handshake.

use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::server::ParsedCertificate;
use rustls::sign::SigningKey;
use rustls::{DistinguishedName, SignatureScheme};
use rustls_pki_types::CertificateDer;
use std::sync::Arc;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use super::{ChainSink, Direction, observe_chain};
use crate::Error;
use crate::bundle::Bundle;

/// Capability to pick an identity by alias and produce its certificate
/// chain and private key.
///
/// `schemes` are the signature schemes the peer will accept (empty means
/// no constraint) and `issuers` the distinguished names of certificate
/// authorities the peer hinted it trusts (empty means no hint).
pub trait KeySelector: Send + Sync + std::fmt::Debug {
    /// Aliases usable for presenting a client certificate, best first.
    fn client_aliases(
        &self,
        schemes: &[SignatureScheme],
        issuers: &[DistinguishedName],
    ) -> Vec<Arc<str>>;

    /// Choose the alias to present as a client.
    fn choose_client_alias(
        &self,
        schemes: &[SignatureScheme],
        issuers: &[DistinguishedName],
    ) -> Option<Arc<str>>;

    /// Aliases usable for presenting a server certificate, best first.
    fn server_aliases(
        &self,
        schemes: &[SignatureScheme],
        issuers: &[DistinguishedName],
    ) -> Vec<Arc<str>>;

    /// Choose the alias to present as a server.
    fn choose_server_alias(
        &self,
        sni: Option<&str>,
        schemes: &[SignatureScheme],
        issuers: &[DistinguishedName],
    ) -> Option<Arc<str>>;

    /// Certificate chain of `alias`, leaf first.
    fn certificate_chain(&self, alias: &str) -> Option<Arc<[CertificateDer<'static>]>>;

    /// Signing key of `alias`.
    fn private_key(&self, alias: &str) -> Option<Arc<dyn SigningKey>>;
}

struct Identity {
    alias: Arc<str>,
    chain: Arc<[CertificateDer<'static>]>,
    key: Arc<dyn SigningKey>,
    leaf_issuer: Option<Vec<u8>>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Identity")
            .field("alias", &self.alias)
            .field("chain_len", &self.chain.len())
            .field("algorithm", &self.key.algorithm())
            .finish()
    }
}

impl Identity {
    fn accepts(&self, schemes: &[SignatureScheme]) -> bool {
        schemes.is_empty() || self.key.choose_scheme(schemes).is_some()
    }

    fn issued_by_any(&self, issuers: &[DistinguishedName]) -> bool {
        self.leaf_issuer
            .as_ref()
            .map(|mine| issuers.iter().any(|dn| dn.as_ref() == mine.as_slice()))
            .unwrap_or(false)
    }

    fn valid_for_name(&self, sni: &str) -> bool {
        let Ok(name) = ServerName::try_from(sni) else {
            return false;
        };
        self.chain
            .first()
            .and_then(|leaf| ParsedCertificate::try_from(leaf).ok())
            .map(|parsed| rustls::client::verify_server_name(&parsed, &name).is_ok())
            .unwrap_or(false)
    }
}

/// [`KeySelector`] over the key material of one [`Bundle`] version.
///
/// Identities the peer can verify are preferred in bundle order, and among
/// those one issued by a hinted authority (or, on servers, valid for the
/// requested SNI) wins.
#[derive(Debug)]
pub struct BundleKeySelector {
    identities: Vec<Identity>,
}

impl BundleKeySelector {
    /// Load the private keys of `bundle` through `provider`.
    pub fn new(bundle: &Bundle, provider: &CryptoProvider) -> Result<Self, Error> {
        let identities = bundle
            .key_material()
            .iter()
            .map(|entry| {
                let Some(leaf) = entry.chain().first() else {
                    return Err(Error::key_material(
                        bundle,
                        format!("alias {} has an empty certificate chain", entry.alias()),
                    ));
                };
                let key = provider
                    .key_provider
                    .load_private_key(entry.key().clone_key())
                    .map_err(|e| {
                        Error::key_material(bundle, format!("alias {}: {}", entry.alias(), e))
                    })?;
                let leaf_issuer = X509Certificate::from_der(leaf.as_ref())
                    .ok()
                    .map(|(_, c)| c.issuer().as_raw().to_vec());
                Ok(Identity {
                    alias: entry.alias().into(),
                    chain: Arc::clone(entry.chain()),
                    key,
                    leaf_issuer,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { identities })
    }

    fn find(&self, alias: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| &*i.alias == alias)
    }

    fn ranked(
        &self,
        schemes: &[SignatureScheme],
        preferred: impl Fn(&Identity) -> bool,
    ) -> Vec<Arc<str>> {
        let (mut first, rest): (Vec<_>, Vec<_>) = self
            .identities
            .iter()
            .filter(|i| i.accepts(schemes))
            .partition(|i| preferred(*i));
        first.extend(rest);
        first.into_iter().map(|i| Arc::clone(&i.alias)).collect()
    }
}

impl KeySelector for BundleKeySelector {
    fn client_aliases(
        &self,
        schemes: &[SignatureScheme],
        issuers: &[DistinguishedName],
    ) -> Vec<Arc<str>> {
        self.ranked(schemes, |i| i.issued_by_any(issuers))
    }

    fn choose_client_alias(
        &self,
        schemes: &[SignatureScheme],
        issuers: &[DistinguishedName],
    ) -> Option<Arc<str>> {
        self.client_aliases(schemes, issuers).into_iter().next()
    }

    fn server_aliases(
        &self,
        schemes: &[SignatureScheme],
        issuers: &[DistinguishedName],
    ) -> Vec<Arc<str>> {
        self.ranked(schemes, |i| i.issued_by_any(issuers))
    }

    fn choose_server_alias(
        &self,
        sni: Option<&str>,
        schemes: &[SignatureScheme],
        issuers: &[DistinguishedName],
    ) -> Option<Arc<str>> {
        match sni {
            Some(sni) => self.ranked(schemes, |i| i.valid_for_name(sni)),
            None => self.server_aliases(schemes, issuers),
        }
        .into_iter()
        .next()
    }

    fn certificate_chain(&self, alias: &str) -> Option<Arc<[CertificateDer<'static>]>> {
        self.find(alias).map(|i| Arc::clone(&i.chain))
    }

    fn private_key(&self, alias: &str) -> Option<Arc<dyn SigningKey>> {
        self.find(alias).map(|i| Arc::clone(&i.key))
    }
}

/// [`KeySelector`] decorator that hands every certificate chain it looks
/// up to a [`ChainSink`] and returns it unchanged.
///
/// Built with [`ObservingKeySelector::for_client`], the selector only
/// presents client identities: the server alias methods answer with
/// nothing. Built with [`ObservingKeySelector::for_server`], every method
/// delegates.
#[derive(Debug)]
pub struct ObservingKeySelector {
    inner: Arc<dyn KeySelector>,
    sink: Arc<dyn ChainSink>,
    direction: Direction,
}

impl ObservingKeySelector {
    /// Observe chains presented on outbound connections, tagged
    /// [`Direction::Client`].
    pub fn for_client(inner: Arc<dyn KeySelector>, sink: Arc<dyn ChainSink>) -> Self {
        Self {
            inner,
            sink,
            direction: Direction::Client,
        }
    }

    /// Observe chains presented on inbound connections, tagged
    /// [`Direction::Server`].
    pub fn for_server(inner: Arc<dyn KeySelector>, sink: Arc<dyn ChainSink>) -> Self {
        Self {
            inner,
            sink,
            direction: Direction::Server,
        }
    }

    /// The tag given to observed chains.
    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl KeySelector for ObservingKeySelector {
    fn client_aliases(
        &self,
        schemes: &[SignatureScheme],
        issuers: &[DistinguishedName],
    ) -> Vec<Arc<str>> {
        self.inner.client_aliases(schemes, issuers)
    }

    fn choose_client_alias(
        &self,
        schemes: &[SignatureScheme],
        issuers: &[DistinguishedName],
    ) -> Option<Arc<str>> {
        self.inner.choose_client_alias(schemes, issuers)
    }

    fn server_aliases(
        &self,
        schemes: &[SignatureScheme],
        issuers: &[DistinguishedName],
    ) -> Vec<Arc<str>> {
        match self.direction {
            Direction::Client => Vec::new(),
            Direction::Server => self.inner.server_aliases(schemes, issuers),
        }
    }

    fn choose_server_alias(
        &self,
        sni: Option<&str>,
        schemes: &[SignatureScheme],
        issuers: &[DistinguishedName],
    ) -> Option<Arc<str>> {
        match self.direction {
            Direction::Client => None,
            Direction::Server => self.inner.choose_server_alias(sni, schemes, issuers),
        }
    }

    fn certificate_chain(&self, alias: &str) -> Option<Arc<[CertificateDer<'static>]>> {
        let chain = self.inner.certificate_chain(alias);
        observe_chain(&self.sink, self.direction, chain.as_deref().unwrap_or_default());
        chain
    }

    fn private_key(&self, alias: &str) -> Option<Arc<dyn SigningKey>> {
        // Needed to sign the handshake in either direction.
        self.inner.private_key(alias)
    }
}
