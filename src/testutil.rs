use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;

use crate::bundle::{BundleMaterial, KeyEntry};
use crate::observe::{CertificateRecord, ChainSink, Direction};
use crate::testdata;

pub(crate) fn material(
    alias: &str,
    key: &[u8],
    cert: &[u8],
    cacert: &[u8],
) -> BundleMaterial {
    BundleMaterial {
        key_material: vec![KeyEntry::new(
            alias,
            testdata::key(key),
            testdata::certs(cert),
        )],
        trust_material: testdata::certs(cacert),
    }
}

pub(crate) fn user1_material() -> BundleMaterial {
    material(
        "client1",
        testdata::USER1_KEY,
        testdata::USER1_CERT,
        testdata::CACERT,
    )
}

pub(crate) fn user2_material() -> BundleMaterial {
    material(
        "client1",
        testdata::USER2_KEY,
        testdata::USER2_CERT,
        testdata::CACERT,
    )
}

pub(crate) fn server_material() -> BundleMaterial {
    material(
        "server",
        testdata::SERVER_KEY,
        testdata::SERVER_CERT,
        testdata::CACERT,
    )
}

/// Chain sink that remembers everything it is given.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    records: Mutex<Vec<(Direction, CertificateRecord)>>,
    calls: Mutex<Vec<(Direction, usize)>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn records(&self) -> Vec<(Direction, CertificateRecord)> {
        self.records.lock().unwrap().clone()
    }

    /// One entry per call: direction and chain length.
    pub(crate) fn calls(&self) -> Vec<(Direction, usize)> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn subjects(&self, direction: Direction) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|(d, _)| *d == direction)
            .map(|(_, r)| r.subject)
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.records.lock().unwrap().clear();
        self.calls.lock().unwrap().clear();
    }
}

impl ChainSink for RecordingSink {
    fn record(&self, direction: Direction, records: &[CertificateRecord]) {
        self.calls.lock().unwrap().push((direction, records.len()));
        let mut log = self.records.lock().unwrap();
        log.extend(records.iter().map(|r| (direction, r.clone())));
    }
}

pub(crate) fn pick_unused_port() -> u16 {
    TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("Cannot find a free TCP port")
}

pub(crate) async fn wait_until_serving(addr: &SocketAddr) {
    for _ in 0..50 {
        if TcpStream::connect(addr).await.is_ok() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
