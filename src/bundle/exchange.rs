//! Change notification queue between [`super::Bundles`] and the watcher.
//!
//! Only the most recent snapshot of each bundle is remembered: if a bundle
//! changes several times before the watcher gets around to it, the watcher
//! sees only the latest version. Bundles keep their place in the queue
//! from the first time they became pending.

use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use super::Bundle;

#[derive(Default)]
struct Inner {
    pending: VecDeque<Arc<Bundle>>,
    waker: Option<Waker>,
}

/// Latest-value-per-name queue of changed bundles.
#[derive(Default)]
pub struct ChangeQueue {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ChangeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ChangeQueue")
            .field("pending", &inner.pending.len())
            .finish()
    }
}

impl ChangeQueue {
    /// Enqueue a changed bundle. A pending snapshot of the same bundle is
    /// replaced if this one is newer; an older one is dropped.
    pub fn push(&self, bundle: Arc<Bundle>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner
            .pending
            .iter_mut()
            .find(|b| b.name() == bundle.name())
        {
            Some(existing) => {
                if existing.version() >= bundle.version() {
                    return;
                }
                *existing = bundle;
            }
            None => inner.pending.push_back(bundle),
        }
        if let Some(waker) = inner.waker.take() {
            waker.wake()
        }
    }

    /// Number of bundles with an undelivered change.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    /// Whether no change is waiting for delivery.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a stream of changed bundles. The queue is meant to have a single
    /// consumer; concurrent readers would compete for the same entries.
    pub fn reader(&self) -> Reader<'_> {
        Reader(self)
    }
}

/// [`Stream`] of changed bundles, in the order they first became pending.
/// Never terminates.
pub struct Reader<'a>(&'a ChangeQueue);

impl Stream for Reader<'_> {
    type Item = Arc<Bundle>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Arc<Bundle>>> {
        let mut inner = self.0.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(b) = inner.pending.pop_front() {
            return Poll::Ready(Some(b));
        }
        let park = inner
            .waker
            .as_ref()
            .map(|w| !w.will_wake(cx.waker()))
            .unwrap_or(true);
        if park {
            let old = inner.waker.replace(cx.waker().clone());
            if let Some(w) = old {
                w.wake();
            }
        }
        Poll::Pending
    }
}
