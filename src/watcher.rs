//! Delivery of bundle changes to registered callbacks.

use futures::StreamExt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::Error;
use crate::bundle::{Bundle, Bundles};

/// Runs the change callbacks registered with a [`Bundles`] registry.
///
/// Each change is delivered to every callback registered for that bundle
/// name, one change at a time, on tokio's blocking thread pool. Changes
/// that pile up while callbacks are busy are coalesced so that only the
/// latest version of each bundle is delivered. A callback that fails or
/// panics is logged and stays registered.
#[derive(Debug, Clone)]
pub struct BundleWatcher {
    bundles: Arc<Bundles>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "callback panicked".into())
}

/// Invoke every callback registered for `bundle`'s name. Returns the
/// failures, which have already been logged.
pub fn deliver(bundles: &Bundles, bundle: &Arc<Bundle>) -> Vec<Error> {
    bundles
        .callbacks(bundle.name())
        .into_iter()
        .filter_map(|callback| {
            let source = match catch_unwind(AssertUnwindSafe(|| callback(bundle))) {
                Ok(Ok(())) => return None,
                Ok(Err(e)) => e,
                Err(payload) => format!("panic: {}", panic_message(&*payload)).into(),
            };
            let err = Error::Callback {
                bundle: bundle.name().into(),
                source,
            };
            log::error!("Version {}: {}", bundle.version(), err);
            Some(err)
        })
        .collect()
}

impl BundleWatcher {
    /// Watch `bundles`. Nothing happens until [`BundleWatcher::run`].
    pub fn new(bundles: Arc<Bundles>) -> Self {
        Self { bundles }
    }

    /// Deliver changes forever. Meant to be spawned as its own task; only
    /// one watcher should run per registry.
    pub async fn run(self) {
        let mut changes = self.bundles.changes().reader();
        while let Some(bundle) = changes.next().await {
            log::debug!(
                "Delivering TLS bundle {} version {}",
                bundle.name(),
                bundle.version()
            );
            let bundles = Arc::clone(&self.bundles);
            if let Err(e) =
                tokio::task::spawn_blocking(move || deliver(&bundles, &bundle)).await
            {
                log::error!("TLS bundle change delivery failed: {}", e);
            }
        }
    }
}
