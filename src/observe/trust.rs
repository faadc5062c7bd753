//! Validation of certificate chains presented by peers.

use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::UnixTime;
use rustls::server::danger::ClientCertVerifier;
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{CertificateError, DistinguishedName, RootCertStore};
use rustls_pki_types::CertificateDer;
use std::sync::Arc;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;

use super::{ChainSink, Direction, observe_chain};
use crate::Error;
use crate::bundle::Bundle;

/// Error failing one handshake because the peer's chain is not trusted.
pub type TrustValidationError = rustls::Error;

/// Name of the public key algorithm of a chain's leaf certificate:
/// `"RSA"`, `"EC"`, `"DSA"` or `"UNKNOWN"`.
pub fn auth_type(chain: &[CertificateDer<'_>]) -> &'static str {
    chain
        .first()
        .and_then(|leaf| X509Certificate::from_der(leaf.as_ref()).ok())
        .and_then(|(_, cert)| match cert.public_key().parsed() {
            Ok(PublicKey::RSA(_)) => Some("RSA"),
            Ok(PublicKey::EC(_)) => Some("EC"),
            Ok(PublicKey::DSA(_)) => Some("DSA"),
            _ => None,
        })
        .unwrap_or("UNKNOWN")
}

/// Capability to decide whether a peer's certificate chain (leaf first)
/// is trusted.
pub trait TrustValidator: Send + Sync + std::fmt::Debug {
    /// Validate a chain presented by a TLS client.
    fn check_client_trusted(
        &self,
        chain: &[CertificateDer<'_>],
        auth_type: &str,
        now: UnixTime,
    ) -> Result<(), TrustValidationError>;

    /// Validate a chain presented by a TLS server. The server name is
    /// checked separately.
    fn check_server_trusted(
        &self,
        chain: &[CertificateDer<'_>],
        auth_type: &str,
        now: UnixTime,
    ) -> Result<(), TrustValidationError>;

    /// Subjects of the certificate authorities this validator trusts.
    /// Possibly empty.
    fn accepted_issuers(&self) -> Arc<[DistinguishedName]>;
}

/// [`TrustValidator`] over the trust material of one [`Bundle`] version,
/// doing standard WebPKI path validation.
#[derive(Debug)]
pub struct BundleTrustValidator {
    roots: Arc<RootCertStore>,
    issuers: Arc<[DistinguishedName]>,
    provider: Arc<CryptoProvider>,
    client_verifier: Option<Arc<dyn ClientCertVerifier>>,
}

impl BundleTrustValidator {
    /// Load the trust anchors of `bundle`. A bundle without trust material
    /// makes a validator that trusts nothing.
    pub fn new(bundle: &Bundle, provider: Arc<CryptoProvider>) -> Result<Self, Error> {
        let mut roots = RootCertStore::empty();
        for cert in bundle.trust_material() {
            roots
                .add(cert.clone())
                .map_err(|e| Error::key_material(bundle, format!("trust anchor: {}", e)))?;
        }
        let roots = Arc::new(roots);
        let client_verifier = if roots.is_empty() {
            None
        } else {
            Some(
                WebPkiClientVerifier::builder_with_provider(
                    Arc::clone(&roots),
                    Arc::clone(&provider),
                )
                .build()
                .map_err(|e| Error::key_material(bundle, e))?,
            )
        };
        Ok(Self {
            issuers: roots.subjects().into(),
            roots,
            provider,
            client_verifier,
        })
    }
}

impl TrustValidator for BundleTrustValidator {
    fn check_client_trusted(
        &self,
        chain: &[CertificateDer<'_>],
        _auth_type: &str,
        now: UnixTime,
    ) -> Result<(), TrustValidationError> {
        let (end_entity, intermediates) = chain
            .split_first()
            .ok_or(rustls::Error::NoCertificatesPresented)?;
        match self.client_verifier {
            Some(ref verifier) => verifier
                .verify_client_cert(end_entity, intermediates, now)
                .map(|_| ()),
            None => Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer,
            )),
        }
    }

    fn check_server_trusted(
        &self,
        chain: &[CertificateDer<'_>],
        _auth_type: &str,
        now: UnixTime,
    ) -> Result<(), TrustValidationError> {
        let (end_entity, intermediates) = chain
            .split_first()
            .ok_or(rustls::Error::NoCertificatesPresented)?;
        let parsed = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )
    }

    fn accepted_issuers(&self) -> Arc<[DistinguishedName]> {
        Arc::clone(&self.issuers)
    }
}

/// [`TrustValidator`] decorator that hands every chain submitted for
/// validation to a [`ChainSink`] before delegating. Verdicts and errors
/// come from the wrapped validator untouched.
#[derive(Debug)]
pub struct ObservingTrustValidator {
    inner: Arc<dyn TrustValidator>,
    sink: Arc<dyn ChainSink>,
}

impl ObservingTrustValidator {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn TrustValidator>, sink: Arc<dyn ChainSink>) -> Self {
        Self { inner, sink }
    }
}

impl TrustValidator for ObservingTrustValidator {
    fn check_client_trusted(
        &self,
        chain: &[CertificateDer<'_>],
        auth_type: &str,
        now: UnixTime,
    ) -> Result<(), TrustValidationError> {
        observe_chain(&self.sink, Direction::Client, chain);
        self.inner.check_client_trusted(chain, auth_type, now)
    }

    fn check_server_trusted(
        &self,
        chain: &[CertificateDer<'_>],
        auth_type: &str,
        now: UnixTime,
    ) -> Result<(), TrustValidationError> {
        observe_chain(&self.sink, Direction::Server, chain);
        self.inner.check_server_trusted(chain, auth_type, now)
    }

    fn accepted_issuers(&self) -> Arc<[DistinguishedName]> {
        self.inner.accepted_issuers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleMaterial;
    use crate::crypto_provider::RustlsCryptoProvider;
    use crate::observe::describe_chain;
    use crate::testdata;
    use crate::testutil::{RecordingSink, user1_material};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rejects any chain whose leaf is `CN=untrusted`, and counts how many
    /// records the sink held at the time it was consulted.
    #[derive(Debug)]
    struct Stub {
        sink: Arc<RecordingSink>,
        records_seen: AtomicUsize,
    }

    impl Stub {
        fn verdict(&self, chain: &[CertificateDer<'_>]) -> Result<(), TrustValidationError> {
            self.records_seen
                .store(self.sink.records().len(), Ordering::SeqCst);
            let leaf = describe_chain(chain).into_iter().next();
            match leaf {
                Some(r) if r.subject == "CN=untrusted" => Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                )),
                Some(_) => Ok(()),
                None => Err(rustls::Error::NoCertificatesPresented),
            }
        }
    }

    impl TrustValidator for Stub {
        fn check_client_trusted(
            &self,
            chain: &[CertificateDer<'_>],
            _: &str,
            _: UnixTime,
        ) -> Result<(), TrustValidationError> {
            self.verdict(chain)
        }

        fn check_server_trusted(
            &self,
            chain: &[CertificateDer<'_>],
            _: &str,
            _: UnixTime,
        ) -> Result<(), TrustValidationError> {
            self.verdict(chain)
        }

        fn accepted_issuers(&self) -> Arc<[DistinguishedName]> {
            Arc::new([])
        }
    }

    fn stub_pair() -> (Arc<Stub>, Arc<RecordingSink>, ObservingTrustValidator) {
        let sink = RecordingSink::new();
        let stub = Arc::new(Stub {
            sink: Arc::clone(&sink),
            records_seen: AtomicUsize::new(0),
        });
        let observed = ObservingTrustValidator::new(stub.clone(), sink.clone());
        (stub, sink, observed)
    }

    fn bundle_validator(material: BundleMaterial) -> BundleTrustValidator {
        let bundle = Bundle::new("self".into(), 1, material);
        BundleTrustValidator::new(&bundle, RustlsCryptoProvider::get().crypto_provider()).unwrap()
    }

    #[test]
    fn same_verdicts_as_wrapped() {
        let (stub, _, observed) = stub_pair();
        let now = UnixTime::now();
        for pem in [
            testdata::USER1_CERT,
            testdata::USER2_CERT,
            testdata::SERVER_CERT,
            testdata::UNTRUSTED_CERT,
        ] {
            let chain = testdata::certs(pem);
            let at = auth_type(&chain);
            assert_eq!(
                observed.check_client_trusted(&chain, at, now),
                stub.check_client_trusted(&chain, at, now)
            );
            assert_eq!(
                observed.check_server_trusted(&chain, at, now),
                stub.check_server_trusted(&chain, at, now)
            );
        }
        assert_eq!(
            observed.check_server_trusted(&[], "UNKNOWN", now),
            Err(rustls::Error::NoCertificatesPresented)
        );
    }

    #[test]
    fn empty_chain_is_logged_as_empty() {
        let (_, sink, observed) = stub_pair();
        let now = UnixTime::now();
        assert_eq!(
            observed.check_server_trusted(&[], "UNKNOWN", now),
            Err(rustls::Error::NoCertificatesPresented)
        );
        assert_eq!(sink.calls(), vec![(Direction::Server, 0)]);
        assert_eq!(
            observed.check_client_trusted(&[], "UNKNOWN", now),
            Err(rustls::Error::NoCertificatesPresented)
        );
        assert_eq!(
            sink.calls(),
            vec![(Direction::Server, 0), (Direction::Client, 0)]
        );
        assert!(sink.records().is_empty());
    }

    #[test]
    fn rejected_chain_is_logged_before_error() {
        let (stub, sink, observed) = stub_pair();
        let chain = testdata::certs(testdata::UNTRUSTED_CERT);
        let err = observed
            .check_server_trusted(&chain, "EC", UnixTime::now())
            .unwrap_err();
        assert_eq!(
            err,
            rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
        );
        assert_eq!(stub.records_seen.load(Ordering::SeqCst), 1);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, Direction::Server);
        assert_eq!(records[0].1.subject, "CN=untrusted");
    }

    #[test]
    fn client_path_tags_client() {
        let (_, sink, observed) = stub_pair();
        observed
            .check_client_trusted(
                &testdata::certs(testdata::USER1_CERT),
                "EC",
                UnixTime::now(),
            )
            .unwrap();
        assert_eq!(sink.subjects(Direction::Client), vec!["CN=client1"]);
        assert!(sink.subjects(Direction::Server).is_empty());
    }

    #[test]
    fn accepted_issuers_delegates() {
        let sink = RecordingSink::new();
        let inner = Arc::new(bundle_validator(user1_material()));
        let observed = ObservingTrustValidator::new(inner.clone(), sink.clone());
        assert_eq!(observed.accepted_issuers().len(), 1);
        assert!(Arc::ptr_eq(
            &observed.accepted_issuers(),
            &inner.accepted_issuers()
        ));
        assert!(sink.records().is_empty());
    }

    #[test]
    fn bundle_validator_accepts_and_rejects() {
        let v = bundle_validator(user1_material());
        let now = UnixTime::now();
        let user2 = testdata::certs(testdata::USER2_CERT);
        assert_eq!(v.check_client_trusted(&user2, "EC", now), Ok(()));
        let server = testdata::certs(testdata::SERVER_CERT);
        assert_eq!(v.check_server_trusted(&server, "EC", now), Ok(()));
        let untrusted = testdata::certs(testdata::UNTRUSTED_CERT);
        assert_eq!(
            v.check_client_trusted(&untrusted, "EC", now),
            Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer
            ))
        );
        assert_eq!(
            v.check_server_trusted(&untrusted, "EC", now),
            Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer
            ))
        );
        assert_eq!(
            v.check_client_trusted(&[], "EC", now),
            Err(rustls::Error::NoCertificatesPresented)
        );
    }

    #[test]
    fn no_trust_material_trusts_nothing() {
        let v = bundle_validator(BundleMaterial::default());
        assert!(v.accepted_issuers().is_empty());
        assert_eq!(
            v.check_client_trusted(
                &testdata::certs(testdata::USER1_CERT),
                "EC",
                UnixTime::now()
            ),
            Err(rustls::Error::InvalidCertificate(
                CertificateError::UnknownIssuer
            ))
        );
    }

    #[test]
    fn garbage_anchor_is_key_material_error() {
        let bundle = Bundle::new(
            "self".into(),
            1,
            BundleMaterial {
                key_material: Vec::new(),
                trust_material: vec![CertificateDer::from(vec![0u8; 8])],
            },
        );
        assert!(matches!(
            BundleTrustValidator::new(&bundle, RustlsCryptoProvider::get().crypto_provider()),
            Err(Error::KeyMaterial { .. })
        ));
    }

    #[test]
    fn auth_type_of_leaf() {
        assert_eq!(auth_type(&testdata::certs(testdata::USER1_CERT)), "EC");
        assert_eq!(auth_type(&[]), "UNKNOWN");
    }
}
