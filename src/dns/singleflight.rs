//! Request coalescing
//!
//! Concurrent callers asking for the same key share one execution. The work
//! runs on its own task, so a caller that gives up (drops its future) does not
//! cancel it for the others.

use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

/// Coalesces concurrent work by key
#[derive(Debug)]
pub struct SingleFlight<T> {
    inflight: Arc<DashMap<String, watch::Receiver<Option<T>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
        }
    }
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty group
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key` unless an execution is already in flight
    ///
    /// Returns the value and whether it was shared with another caller.
    /// Returns `None` only if the work task panicked.
    pub async fn work<F, Fut>(&self, key: &str, make: F) -> Option<(T, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (mut rx, shared) = match self.inflight.entry(key.to_owned()) {
            Entry::Occupied(entry) => (entry.get().clone(), true),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx.clone());

                let fut = make();
                let inflight = Arc::clone(&self.inflight);
                let key = key.to_owned();
                tokio::spawn(async move {
                    let release = Release { inflight, key };
                    let value = fut.await;
                    drop(release);
                    let _ = tx.send(Some(value));
                });
                (rx, false)
            }
        };

        let value = rx.wait_for(Option::is_some).await.ok()?.clone()?;
        Some((value, shared))
    }

    /// Number of keys currently in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    /// Whether nothing is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

/// Frees the key even if the work panics
struct Release<T> {
    inflight: Arc<DashMap<String, watch::Receiver<Option<T>>>>,
    key: String,
}

impl<T> Drop for Release<T> {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
    }
}
