//! Named, versioned snapshots of TLS key and trust material.
//!
//! A [`Bundle`] is immutable. Changing a bundle means publishing a new
//! snapshot with the next version number through [`Bundles::update`];
//! everybody holding the previous `Arc<Bundle>` keeps a consistent view of
//! the old key and trust material until they let go of it.

use arc_swap::ArcSwap;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::Error;

pub mod exchange;

/// One identity within a bundle: a private key and the certificate chain
/// (leaf first) that goes with it.
#[derive(Debug)]
pub struct KeyEntry {
    alias: Arc<str>,
    key: PrivateKeyDer<'static>,
    chain: Arc<[CertificateDer<'static>]>,
}

impl KeyEntry {
    /// Create a new key entry.
    pub fn new(
        alias: impl Into<Arc<str>>,
        key: PrivateKeyDer<'static>,
        chain: impl Into<Arc<[CertificateDer<'static>]>>,
    ) -> Self {
        Self {
            alias: alias.into(),
            key,
            chain: chain.into(),
        }
    }

    /// Name of this entry within its bundle.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// The private key.
    pub fn key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    /// Certificate chain, leaf first.
    pub fn chain(&self) -> &Arc<[CertificateDer<'static>]> {
        &self.chain
    }
}

/// Key and trust material making up the contents of a bundle.
#[derive(Debug, Default)]
pub struct BundleMaterial {
    /// Identities that may be presented to peers, in order of preference.
    pub key_material: Vec<KeyEntry>,
    /// Certificates of issuers trusted to vouch for peers.
    pub trust_material: Vec<CertificateDer<'static>>,
}

/// A named snapshot of TLS key and trust material.
#[derive(Debug)]
pub struct Bundle {
    name: Arc<str>,
    version: u64,
    material: BundleMaterial,
}

impl Bundle {
    pub(crate) fn new(name: Arc<str>, version: u64, material: BundleMaterial) -> Self {
        Self {
            name,
            version,
            material,
        }
    }

    /// The bundle's name, which never changes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version of this snapshot. The first snapshot is version 1 and each
    /// successful update increments it by one.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Key entries of this snapshot.
    pub fn key_material(&self) -> &[KeyEntry] {
        &self.material.key_material
    }

    /// Trusted issuer certificates of this snapshot.
    pub fn trust_material(&self) -> &[CertificateDer<'static>] {
        &self.material.trust_material
    }
}

/// Callback invoked by the [`crate::BundleWatcher`] with each new snapshot
/// of the bundle it was registered for.
pub type ChangeCallback = Box<
    dyn Fn(&Arc<Bundle>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync,
>;

struct Slot {
    current: ArcSwap<Bundle>,
    update: Mutex<()>,
    callbacks: Mutex<Vec<Arc<ChangeCallback>>>,
}

/// Registry of named bundles.
///
/// Updates are published here and queued for delivery to change callbacks
/// by a [`crate::BundleWatcher`].
#[derive(Default)]
pub struct Bundles {
    slots: RwLock<HashMap<Arc<str>, Arc<Slot>>>,
    changes: exchange::ChangeQueue,
}

impl std::fmt::Debug for Bundles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Bundles")
            .field("names", &slots.keys().collect::<Vec<_>>())
            .field("changes", &self.changes)
            .finish()
    }
}

impl Bundles {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, name: &str) -> Result<Arc<Slot>, Error> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::BundleNotFound(name.into()))
    }

    /// Register a new bundle. Its first snapshot is version 1.
    pub fn insert(&self, name: &str, material: BundleMaterial) -> Result<Arc<Bundle>, Error> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.contains_key(name) {
            return Err(Error::DuplicateBundle(name.into()));
        }
        let name: Arc<str> = name.into();
        let bundle = Arc::new(Bundle::new(Arc::clone(&name), 1, material));
        slots.insert(
            name,
            Arc::new(Slot {
                current: ArcSwap::new(Arc::clone(&bundle)),
                update: Mutex::new(()),
                callbacks: Mutex::new(Vec::new()),
            }),
        );
        Ok(bundle)
    }

    /// Current snapshot of the named bundle.
    pub fn get_bundle(&self, name: &str) -> Result<Arc<Bundle>, Error> {
        Ok(self.slot(name)?.current.load_full())
    }

    /// Whether a bundle is registered under this name.
    pub fn contains(&self, name: &str) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Publish new contents for the named bundle and queue a change
    /// notification. Returns the new snapshot.
    pub fn update(&self, name: &str, material: BundleMaterial) -> Result<Arc<Bundle>, Error> {
        let slot = self.slot(name)?;
        let _serialize = slot.update.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = slot.current.load();
        let bundle = Arc::new(Bundle::new(
            Arc::clone(&previous.name),
            previous.version + 1,
            material,
        ));
        slot.current.store(Arc::clone(&bundle));
        self.changes.push(Arc::clone(&bundle));
        log::debug!(
            "TLS bundle {} updated to version {}",
            bundle.name(),
            bundle.version()
        );
        Ok(bundle)
    }

    /// Register a callback to be invoked with each new snapshot of the
    /// named bundle. Callbacks stay registered for the life of the
    /// registry, even if they fail.
    pub fn register_change_callback<F>(&self, name: &str, callback: F) -> Result<(), Error>
    where
        F: Fn(&Arc<Bundle>) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        let callback: ChangeCallback = Box::new(callback);
        self.slot(name)?
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
        Ok(())
    }

    pub(crate) fn callbacks(&self, name: &str) -> Vec<Arc<ChangeCallback>> {
        self.slot(name)
            .map(|slot| {
                slot.callbacks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
            .unwrap_or_default()
    }

    /// Queue of bundles that changed and whose callbacks have not yet run.
    pub fn changes(&self) -> &exchange::ChangeQueue {
        &self.changes
    }
}
