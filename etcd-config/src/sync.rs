//! Background synchronization task for keeping the cache updated.
//!
//! The task owns the change stream and is the only writer of the cache once
//! the first load has succeeded. A load reads the namespace at some revision
//! `R` and opens the watch at `R + 1`, so the stream picks up exactly where
//! the snapshot leaves off. Any disruption of the stream triggers a fresh
//! load, retried at a fixed interval until the store answers again.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Error;
use crate::cache::Cache;
use crate::namespace::Namespace;
use crate::store::{KeyEvent, Store, WatchStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// First load in progress; the handle is not returned yet.
    Loading,
    Watching,
    /// The stream ended; reloading until the store answers.
    Reconnecting,
    Stopped,
}

pub struct SyncTask {
    store: Arc<dyn Store>,
    namespace: Namespace,
    cache: Arc<Cache>,
    revision: Arc<AtomicI64>,
    state: watch::Sender<SyncState>,
    retry_delay: Duration,
    shutdown: CancellationToken,
}

impl SyncTask {
    pub fn new(
        store: Arc<dyn Store>,
        namespace: Namespace,
        cache: Arc<Cache>,
        revision: Arc<AtomicI64>,
        state: watch::Sender<SyncState>,
        retry_delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            namespace,
            cache,
            revision,
            state,
            retry_delay,
            shutdown,
        }
    }

    /// Loads the namespace into the cache and opens the change stream that
    /// continues from the loaded revision. On success the state is
    /// `Watching` before this returns.
    pub async fn init_and_watch(&self) -> Result<WatchStream, Error> {
        let prefix = self.namespace.prefix();
        let snapshot = self.store.get(prefix).await?;
        let stream = self.store.watch(prefix, snapshot.revision + 1).await?;

        let count = snapshot.entries.len();
        self.cache.load(
            snapshot
                .entries
                .into_iter()
                .map(|(k, v)| (self.namespace.to_relative(&k).to_string(), v)),
        );
        self.revision.store(snapshot.revision, Ordering::SeqCst);
        self.state.send_replace(SyncState::Watching);

        info!(
            namespace = self.namespace.name(),
            revision = snapshot.revision,
            entries = count,
            "namespace loaded"
        );
        Ok(stream)
    }

    /// Pumps events from `stream` into the cache until shutdown, reloading
    /// whenever the stream ends.
    pub async fn run(self, mut stream: WatchStream) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(events)) => self.apply_events(events),
                Some(Err(e)) => {
                    warn!(namespace = self.namespace.name(), error = %e, "watch stream failed");
                    match self.reconnect().await {
                        Some(fresh) => stream = fresh,
                        None => break,
                    }
                }
                None => {
                    warn!(namespace = self.namespace.name(), "watch stream closed");
                    match self.reconnect().await {
                        Some(fresh) => stream = fresh,
                        None => break,
                    }
                }
            }
        }

        self.state.send_replace(SyncState::Stopped);
        debug!(namespace = self.namespace.name(), "sync task stopped");
    }

    /// Retries [`init_and_watch`](Self::init_and_watch) every `retry_delay`
    /// until it succeeds. Returns `None` only on shutdown.
    async fn reconnect(&self) -> Option<WatchStream> {
        self.state.send_replace(SyncState::Reconnecting);
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                result = self.init_and_watch() => result,
            };

            match result {
                Ok(stream) => {
                    info!(namespace = self.namespace.name(), attempt, "watch re-established");
                    return Some(stream);
                }
                Err(e) => {
                    warn!(
                        namespace = self.namespace.name(),
                        attempt,
                        error = %e,
                        "reload failed, retrying in {:?}",
                        self.retry_delay
                    );
                }
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    fn apply_events(&self, events: Vec<KeyEvent>) {
        // Every event at or below this revision is already in the cache.
        // Events of one revision arrive together, so the floor is read once.
        let floor = self.revision.load(Ordering::SeqCst);
        let mut applied = 0usize;

        for event in events {
            if event.revision <= floor {
                debug!(key = %event.key, revision = event.revision, "skipping stale event");
                continue;
            }
            let is_delete = event.is_delete();
            let key = self.namespace.to_relative(&event.key).to_string();
            self.cache.apply(key, event.value, is_delete);
            self.revision.fetch_max(event.revision, Ordering::SeqCst);
            applied += 1;
        }

        debug!(
            namespace = self.namespace.name(),
            applied,
            revision = self.revision.load(Ordering::SeqCst),
            "applied watch events"
        );
    }
}
