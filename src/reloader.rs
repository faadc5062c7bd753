//! Ownership and replacement of objects built from a bundle.
//!
//! A [`Reloader`] holds the current instance of some object derived from a
//! bundle (an HTTP client, a listener's TLS configuration...). When the
//! bundle changes it builds a replacement off to the side while the current
//! instance keeps serving, then swaps the replacement in with a single
//! atomic store. If the build fails, nothing changes.
//!
//! Rebuilds of one [`Reloader`] never overlap. A trigger carrying a bundle
//! version that is not newer than the published one is skipped, so after
//! any sequence of triggers the published instance is built from the most
//! recent version seen.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::Error;
use crate::bundle::{Bundle, Bundles};

/// Knows how to build one kind of object from a bundle.
pub trait DependentFactory: Send + Sync + 'static {
    /// The object built.
    type Object: Send + Sync + 'static;

    /// What the object is, for log messages.
    fn describe(&self) -> &str;

    /// Build a new instance from `bundle`. Must not touch the currently
    /// published instance.
    fn create(&self, bundle: &Bundle) -> Result<Self::Object, Error>;

    /// Called right after `instance` is published, before any other
    /// rebuild can start.
    fn published(&self, _instance: &Arc<Self::Object>) {}

    /// Called exactly once for each instance that has been replaced.
    /// Readers that loaded it before the swap may still hold references.
    fn retire(&self, _instance: Arc<Self::Object>) {}
}

struct Published<T> {
    instance: Arc<T>,
    version: u64,
}

struct RebuildingFlag<'a>(&'a AtomicBool);

impl<'a> RebuildingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for RebuildingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owner of the current instance of a [`DependentFactory::Object`].
pub struct Reloader<F: DependentFactory> {
    bundle: Arc<str>,
    factory: F,
    current: ArcSwap<Published<F::Object>>,
    rebuild: Mutex<()>,
    rebuilding: AtomicBool,
}

impl<F: DependentFactory> std::fmt::Debug for Reloader<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Reloader")
            .field("object", &self.factory.describe())
            .field("bundle", &self.bundle)
            .field("version", &self.version())
            .field("rebuilding", &self.is_rebuilding())
            .finish()
    }
}

impl<F: DependentFactory> Reloader<F> {
    /// Build the first instance from `bundle`.
    pub fn new(factory: F, bundle: &Bundle) -> Result<Self, Error> {
        let instance = factory.create(bundle)?;
        log::info!(
            "Built {} from bundle {} version {}",
            factory.describe(),
            bundle.name(),
            bundle.version()
        );
        Ok(Self::with_initial(factory, bundle, instance))
    }

    /// Adopt an instance built elsewhere from `bundle`.
    pub fn with_initial(factory: F, bundle: &Bundle, instance: F::Object) -> Self {
        Self {
            bundle: bundle.name().into(),
            factory,
            current: ArcSwap::from_pointee(Published {
                instance: Arc::new(instance),
                version: bundle.version(),
            }),
            rebuild: Mutex::new(()),
            rebuilding: AtomicBool::new(false),
        }
    }

    /// The current instance. Never a partially built one.
    pub fn current(&self) -> Arc<F::Object> {
        Arc::clone(&self.current.load().instance)
    }

    /// Bundle version the current instance was built from.
    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Name of the bundle instances are built from.
    pub fn bundle_name(&self) -> &str {
        &self.bundle
    }

    /// Whether a replacement is being built right now.
    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::Acquire)
    }

    /// The factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Build a replacement from `bundle` and publish it.
    ///
    /// Returns `Ok(false)` without building anything if `bundle` is not
    /// newer than the published instance. On error the published instance
    /// is left alone. Waits for any rebuild already in progress.
    pub fn reload(&self, bundle: &Bundle) -> Result<bool, Error> {
        if bundle.name() != &*self.bundle {
            log::warn!(
                "Ignoring bundle {} offered to the {} built from bundle {}",
                bundle.name(),
                self.factory.describe(),
                self.bundle
            );
            return Ok(false);
        }
        let _serialize = self.rebuild.lock().unwrap_or_else(PoisonError::into_inner);
        let published_version = self.current.load().version;
        if bundle.version() <= published_version {
            log::debug!(
                "Not rebuilding {} from bundle {} version {}: version {} is already published",
                self.factory.describe(),
                self.bundle,
                bundle.version(),
                published_version
            );
            return Ok(false);
        }

        let built = {
            let _flag = RebuildingFlag::raise(&self.rebuilding);
            self.factory.create(bundle)
        };
        let instance = match built {
            Ok(instance) => Arc::new(instance),
            Err(e) => {
                log::warn!(
                    "Could not rebuild {} from bundle {} version {}, still using version {}: {}",
                    self.factory.describe(),
                    self.bundle,
                    bundle.version(),
                    published_version,
                    e
                );
                return Err(e);
            }
        };

        let old = self.current.swap(Arc::new(Published {
            instance: Arc::clone(&instance),
            version: bundle.version(),
        }));
        self.factory.published(&instance);
        log::info!(
            "Reloaded {} from bundle {} version {}",
            self.factory.describe(),
            self.bundle,
            bundle.version()
        );
        self.factory.retire(Arc::clone(&old.instance));
        Ok(true)
    }

    /// Rebuild whenever the bundle changes in `bundles`. The registration
    /// does not keep the reloader alive.
    ///
    /// A version published before the registration took effect is picked
    /// up right away. If that rebuild fails it is logged and the current
    /// instance stays.
    pub fn watch(self: &Arc<Self>, bundles: &Bundles) -> Result<(), Error> {
        let weak = Arc::downgrade(self);
        bundles.register_change_callback(&self.bundle, move |bundle| match weak.upgrade() {
            Some(reloader) => reloader.reload(bundle).map(|_| ()).map_err(Into::into),
            None => Ok(()),
        })?;
        let latest = bundles.get_bundle(&self.bundle)?;
        // Already logged by reload.
        let _ = self.reload(&latest);
        Ok(())
    }
}
