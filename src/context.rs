//! Construction of rustls configurations from one bundle version.
//!
//! A [`TlsContext`] is built from exactly one [`Bundle`] snapshot and never
//! changes afterwards. When the bundle changes, a new context is built.
//!
//! Inside the configuration, rustls reaches the bundle's material through
//! a [`KeySelector`] and a [`TrustValidator`], optionally wrapped by the
//! chain-observing decorators so that every chain presented or validated
//! reaches the builder's [`ChainSink`].

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ClientConfig, ResolvesClientCert, verify_server_name};
use rustls::crypto::{
    CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ParsedCertificate, ResolvesServerCert, ServerConfig};
use rustls::sign::CertifiedKey;
use rustls::{
    ConfigBuilder, DigitallySignedStruct, DistinguishedName, SignatureScheme,
    SupportedProtocolVersion,
};
use std::sync::Arc;

use crate::Error;
use crate::bundle::Bundle;
use crate::observe::key_selector::{BundleKeySelector, KeySelector, ObservingKeySelector};
use crate::observe::trust::{
    BundleTrustValidator, ObservingTrustValidator, TrustValidator, auth_type,
};
use crate::observe::{ChainSink, Direction, LogSink};

/// A rustls configuration together with the bundle version it was built
/// from.
#[derive(Debug)]
pub struct TlsContext<C> {
    config: Arc<C>,
    bundle: Arc<str>,
    version: u64,
}

impl<C> Clone for TlsContext<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            bundle: Arc::clone(&self.bundle),
            version: self.version,
        }
    }
}

impl<C> TlsContext<C> {
    /// The rustls configuration.
    pub fn config(&self) -> &Arc<C> {
        &self.config
    }

    /// Name of the bundle this context was built from.
    pub fn bundle_name(&self) -> &str {
        &self.bundle
    }

    /// Version of the bundle this context was built from.
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Context for outbound connections.
pub type ClientContext = TlsContext<ClientConfig>;

/// Context for inbound connections.
pub type ServerContext = TlsContext<ServerConfig>;

/// Which of a bundle's material is wrapped with the chain-observing
/// decorators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observe {
    /// Observe chains we present.
    pub key_material: bool,
    /// Observe chains peers present to us.
    pub trust_material: bool,
}

impl Default for Observe {
    fn default() -> Self {
        Self {
            key_material: true,
            trust_material: true,
        }
    }
}

impl Observe {
    /// Observe nothing.
    pub fn none() -> Self {
        Self {
            key_material: false,
            trust_material: false,
        }
    }
}

/// Builds [`TlsContext`]s from bundles.
#[derive(Clone, Debug)]
pub struct ContextBuilder {
    crypto_provider: Arc<CryptoProvider>,
    sink: Arc<dyn ChainSink>,
    observe: Observe,
    protocol_versions: Vec<&'static SupportedProtocolVersion>,
    alpn_protocols: Vec<Vec<u8>>,
}

impl ContextBuilder {
    /// A builder using `crypto_provider`, observing all material into
    /// [`LogSink`], with the rustls default protocol versions and no ALPN.
    pub fn new(crypto_provider: Arc<CryptoProvider>) -> Self {
        Self {
            crypto_provider,
            sink: Arc::new(LogSink),
            observe: Observe::default(),
            protocol_versions: rustls::DEFAULT_VERSIONS.to_vec(),
            alpn_protocols: Vec::new(),
        }
    }

    /// Send observed chains somewhere other than the log.
    pub fn with_sink(mut self, sink: Arc<dyn ChainSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Select which material is observed.
    pub fn with_observe(mut self, observe: Observe) -> Self {
        self.observe = observe;
        self
    }

    /// Restrict the protocol versions offered.
    pub fn with_protocol_versions(
        mut self,
        versions: &[&'static SupportedProtocolVersion],
    ) -> Self {
        self.protocol_versions = versions.to_vec();
        self
    }

    /// Set the ALPN protocols offered, most preferred first.
    pub fn with_alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    /// The crypto provider contexts are built with.
    pub fn crypto_provider(&self) -> &Arc<CryptoProvider> {
        &self.crypto_provider
    }

    fn check_random(&self) -> Result<(), Error> {
        let mut probe = [0u8; 32];
        self.crypto_provider
            .secure_random
            .fill(&mut probe)
            .map_err(|e| Error::ContextInitialization(e.into()))
    }

    fn key_selector(
        &self,
        bundle: &Bundle,
        direction: Direction,
    ) -> Result<Arc<dyn KeySelector>, Error> {
        let inner: Arc<dyn KeySelector> =
            Arc::new(BundleKeySelector::new(bundle, &self.crypto_provider)?);
        if !self.observe.key_material {
            return Ok(inner);
        }
        let sink = Arc::clone(&self.sink);
        Ok(Arc::new(match direction {
            Direction::Client => ObservingKeySelector::for_client(inner, sink),
            Direction::Server => ObservingKeySelector::for_server(inner, sink),
        }))
    }

    fn trust_validator(&self, bundle: &Bundle) -> Result<Arc<dyn TrustValidator>, Error> {
        let inner: Arc<dyn TrustValidator> = Arc::new(BundleTrustValidator::new(
            bundle,
            Arc::clone(&self.crypto_provider),
        )?);
        if !self.observe.trust_material {
            return Ok(inner);
        }
        Ok(Arc::new(ObservingTrustValidator::new(
            inner,
            Arc::clone(&self.sink),
        )))
    }

    // Every identity must be usable before the context is handed out.
    fn check_identities(&self, bundle: &Bundle, keys: &dyn KeySelector) -> Result<(), Error> {
        for entry in bundle.key_material() {
            let alias = entry.alias();
            let chain = keys.certificate_chain(alias).ok_or_else(|| {
                Error::key_material(bundle, format!("alias {} has no certificate chain", alias))
            })?;
            let key = keys.private_key(alias).ok_or_else(|| {
                Error::key_material(bundle, format!("alias {} has no private key", alias))
            })?;
            CertifiedKey::new(chain.to_vec(), key)
                .keys_match()
                .map_err(|e| Error::key_material(bundle, format!("alias {}: {}", alias, e)))?;
        }
        Ok(())
    }

    fn supported_algs(&self) -> WebPkiSupportedAlgorithms {
        self.crypto_provider.signature_verification_algorithms
    }

    /// Build a context for outbound connections, presenting the bundle's
    /// key material as client identities and verifying servers against
    /// its trust material.
    pub fn build_client(&self, bundle: &Bundle) -> Result<ClientContext, Error> {
        self.check_random()?;
        if bundle.trust_material().is_empty() {
            return Err(Error::key_material(
                bundle,
                "no trust material to verify servers with",
            ));
        }
        let keys = self.key_selector(bundle, Direction::Client)?;
        self.check_identities(bundle, &*keys)?;
        let backend = Arc::new(ClientBackend {
            keys,
            trust: self.trust_validator(bundle)?,
            supported_algs: self.supported_algs(),
        });
        let mut config = ClientConfig::builder_with_provider(Arc::clone(&self.crypto_provider))
            .with_protocol_versions(&self.protocol_versions)
            .map_err(Error::ContextInitialization)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::clone(&backend) as Arc<dyn ServerCertVerifier>)
            .with_client_cert_resolver(backend);
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(TlsContext {
            config: Arc::new(config),
            bundle: bundle.name().into(),
            version: bundle.version(),
        })
    }

    /// Build a context for inbound connections, presenting the bundle's
    /// key material as server identities. With [`ClientAuthEnabled`],
    /// clients must present a chain trusted by the bundle's trust material.
    pub fn build_server<CA: ClientAuthMode>(&self, bundle: &Bundle) -> Result<ServerContext, Error> {
        self.check_random()?;
        if bundle.key_material().is_empty() {
            return Err(Error::key_material(bundle, "no key material to present"));
        }
        if CA::VERIFIES_CLIENTS && bundle.trust_material().is_empty() {
            return Err(Error::key_material(
                bundle,
                "no trust material to verify clients with",
            ));
        }
        let keys = self.key_selector(bundle, Direction::Server)?;
        self.check_identities(bundle, &*keys)?;
        let trust = self.trust_validator(bundle)?;
        let backend = Arc::new(ServerBackend {
            keys,
            issuers: trust.accepted_issuers(),
            trust,
            supported_algs: self.supported_algs(),
        });
        let scb = ServerConfig::builder_with_provider(Arc::clone(&self.crypto_provider))
            .with_protocol_versions(&self.protocol_versions)
            .map_err(Error::ContextInitialization)?;
        let mut config = CA::configure_client_auth(&backend, scb).with_cert_resolver(backend);
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(TlsContext {
            config: Arc::new(config),
            bundle: bundle.name().into(),
            version: bundle.version(),
        })
    }
}

fn whole_chain<'a>(
    end_entity: &'a CertificateDer<'_>,
    intermediates: &'a [CertificateDer<'_>],
) -> Vec<CertificateDer<'a>> {
    std::iter::once(end_entity)
        .chain(intermediates)
        .map(|c| CertificateDer::from(c.as_ref()))
        .collect()
}

fn certified_key(keys: &dyn KeySelector, alias: &str) -> Option<Arc<CertifiedKey>> {
    let chain = keys.certificate_chain(alias)?;
    let key = keys.private_key(alias)?;
    Some(Arc::new(CertifiedKey::new(chain.to_vec(), key)))
}

#[derive(Debug)]
struct ClientBackend {
    keys: Arc<dyn KeySelector>,
    trust: Arc<dyn TrustValidator>,
    supported_algs: WebPkiSupportedAlgorithms,
}

impl ResolvesClientCert for ClientBackend {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        let issuers = root_hint_subjects
            .iter()
            .map(|raw| DistinguishedName::from(raw.to_vec()))
            .collect::<Vec<_>>();
        let alias = self.keys.choose_client_alias(sigschemes, &issuers)?;
        certified_key(&*self.keys, &alias)
    }

    fn has_certs(&self) -> bool {
        !self.keys.client_aliases(&[], &[]).is_empty()
    }
}

impl ServerCertVerifier for ClientBackend {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let chain = whole_chain(end_entity, intermediates);
        self.trust
            .check_server_trusted(&chain, auth_type(&chain), now)?;
        let parsed = ParsedCertificate::try_from(end_entity)?;
        verify_server_name(&parsed, server_name)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

/// Adapter exposing a bundle's selector and validator to rustls on the
/// server side. Not constructible outside this crate.
#[derive(Debug)]
pub struct ServerBackend {
    keys: Arc<dyn KeySelector>,
    trust: Arc<dyn TrustValidator>,
    issuers: Arc<[DistinguishedName]>,
    supported_algs: WebPkiSupportedAlgorithms,
}

impl ResolvesServerCert for ServerBackend {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let alias = self.keys.choose_server_alias(
            client_hello.server_name(),
            client_hello.signature_schemes(),
            client_hello.certificate_authorities().unwrap_or_default(),
        )?;
        certified_key(&*self.keys, &alias)
    }
}

impl ClientCertVerifier for ServerBackend {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.issuers
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let chain = whole_chain(end_entity, intermediates);
        self.trust
            .check_client_trusted(&chain, auth_type(&chain), now)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

/// Trait for either [`ClientAuthEnabled`] or [`ClientAuthDisabled`].
pub trait ClientAuthMode {
    #[doc(hidden)]
    const VERIFIES_CLIENTS: bool;

    #[doc(hidden)]
    fn configure_client_auth(
        backend: &Arc<ServerBackend>,
        scb: ConfigBuilder<ServerConfig, rustls::WantsVerifier>,
    ) -> ConfigBuilder<ServerConfig, rustls::server::WantsServerCert>;
}

/// Type argument for [`ContextBuilder::build_server`] to request mutual
/// TLS auth.
pub enum ClientAuthEnabled {}

impl ClientAuthMode for ClientAuthEnabled {
    const VERIFIES_CLIENTS: bool = true;

    fn configure_client_auth(
        backend: &Arc<ServerBackend>,
        scb: ConfigBuilder<ServerConfig, rustls::WantsVerifier>,
    ) -> ConfigBuilder<ServerConfig, rustls::server::WantsServerCert> {
        let verifier = Arc::clone(backend);
        scb.with_client_cert_verifier(verifier)
    }
}

/// Type argument for [`ContextBuilder::build_server`] to request no client
/// auth.
pub enum ClientAuthDisabled {}

impl ClientAuthMode for ClientAuthDisabled {
    const VERIFIES_CLIENTS: bool = false;

    fn configure_client_auth(
        _: &Arc<ServerBackend>,
        scb: ConfigBuilder<ServerConfig, rustls::WantsVerifier>,
    ) -> ConfigBuilder<ServerConfig, rustls::server::WantsServerCert> {
        scb.with_no_client_auth()
    }
}
