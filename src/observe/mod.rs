//! Observation of certificate chains going through TLS handshakes.
//!
//! The [`key_selector::ObservingKeySelector`] and
//! [`trust::ObservingTrustValidator`] wrappers hand every chain they see
//! to a [`ChainSink`] before passing it on untouched. The default sink,
//! [`LogSink`], writes one log record per certificate.

use rustls_pki_types::CertificateDer;
use std::sync::Arc;
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

pub mod key_selector;
pub mod trust;

/// Which side of a handshake a chain belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// A chain presented by (or expected from) a TLS client.
    Client,
    /// A chain presented by (or expected from) a TLS server.
    Server,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.write_str(match self {
            Self::Client => "CLIENT",
            Self::Server => "SERVER",
        })
    }
}

/// The loggable details of one certificate in a chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateRecord {
    /// Position in the chain, starting at 1 for the leaf.
    pub index: usize,
    /// Subject distinguished name.
    pub subject: String,
    /// Issuer distinguished name.
    pub issuer: String,
    /// Serial number, in decimal.
    pub serial: String,
    /// Start of the validity period.
    pub not_before: Option<OffsetDateTime>,
    /// End of the validity period.
    pub not_after: Option<OffsetDateTime>,
}

const UNPARSEABLE: &str = "<unparseable>";

impl CertificateRecord {
    /// Extract the details of `der`, which sits at `index` (1-based) in
    /// its chain. A certificate that cannot be parsed still produces a
    /// record, with placeholder fields.
    pub fn new(index: usize, der: &CertificateDer<'_>) -> Self {
        match X509Certificate::from_der(der.as_ref()) {
            Ok((_, cert)) => Self {
                index,
                subject: cert.subject().to_string(),
                issuer: cert.issuer().to_string(),
                serial: cert.tbs_certificate.serial.to_string(),
                not_before: Some(cert.validity().not_before.to_datetime()),
                not_after: Some(cert.validity().not_after.to_datetime()),
            },
            Err(_) => Self {
                index,
                subject: UNPARSEABLE.into(),
                issuer: UNPARSEABLE.into(),
                serial: UNPARSEABLE.into(),
                not_before: None,
                not_after: None,
            },
        }
    }
}

fn fmt_time(t: &Option<OffsetDateTime>) -> String {
    t.map(|t| t.to_string())
        .unwrap_or_else(|| UNPARSEABLE.into())
}

impl std::fmt::Display for CertificateRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "certificate #{}: subject={} issuer={} serial={} not_before={} not_after={}",
            self.index,
            self.subject,
            self.issuer,
            self.serial,
            fmt_time(&self.not_before),
            fmt_time(&self.not_after)
        )
    }
}

/// Describe every certificate of `chain`, leaf first.
pub fn describe_chain(chain: &[CertificateDer<'_>]) -> Vec<CertificateRecord> {
    chain
        .iter()
        .enumerate()
        .map(|(i, der)| CertificateRecord::new(i + 1, der))
        .collect()
}

/// Destination for observed certificate chains.
///
/// Implementations are called from inside TLS handshakes, possibly many
/// at once, and must not block.
pub trait ChainSink: Send + Sync + std::fmt::Debug {
    /// Receive the records of one chain, leaf first. `records` is empty if
    /// the chain was absent or empty.
    fn record(&self, direction: Direction, records: &[CertificateRecord]);
}

/// [`ChainSink`] writing to the [`log`] facade: one INFO record per
/// certificate, or an ERROR record if the chain is empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ChainSink for LogSink {
    fn record(&self, direction: Direction, records: &[CertificateRecord]) {
        if records.is_empty() {
            log::error!("No {} certificates found", direction);
            return;
        }
        for r in records {
            log::info!("{} {}", direction, r);
        }
    }
}

/// Describe `chain` and hand it to `sink`.
pub(crate) fn observe_chain(
    sink: &Arc<dyn ChainSink>,
    direction: Direction,
    chain: &[CertificateDer<'_>],
) {
    sink.record(direction, &describe_chain(chain));
}
