//! Revisioned in-memory store, useful as a stand-in for etcd.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::Error;
use crate::store::{KeyEvent, Snapshot, Store, WatchStream};

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Vec<KeyEvent>>,
}

#[derive(Default)]
struct State {
    revision: i64,
    compacted: i64,
    data: BTreeMap<String, String>,
    // Every event since the last compaction; watches replay from here.
    history: Vec<KeyEvent>,
    watchers: Vec<Watcher>,
}

/// Every `put` and `delete` bumps the revision by one, like etcd.
///
/// Change history is kept so watches can start at any past revision. It
/// grows with every write until [`compact`](Self::compact) drops the events
/// below a revision, after which watches starting there fail with
/// [`Error::Compacted`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    failing_gets: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) -> i64 {
        let key = key.into();
        let value = value.into();
        let mut state = self.lock();
        state.revision += 1;
        if value.is_empty() {
            state.data.remove(&key);
        } else {
            state.data.insert(key.clone(), value.clone());
        }
        let revision = state.revision;
        state.publish(KeyEvent {
            key,
            value,
            revision,
        });
        revision
    }

    /// Deleting an absent key does not create a revision.
    pub fn delete(&self, key: &str) -> Option<i64> {
        let mut state = self.lock();
        state.data.remove(key)?;
        state.revision += 1;
        let revision = state.revision;
        state.publish(KeyEvent {
            key: key.to_string(),
            value: String::new(),
            revision,
        });
        Some(revision)
    }

    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    /// Discards history below `revision`. Compacting backwards is a no-op.
    pub fn compact(&self, revision: i64) {
        let mut state = self.lock();
        let revision = revision.min(state.revision);
        if revision <= state.compacted {
            return;
        }
        state.compacted = revision;
        state.history.retain(|e| e.revision >= revision);
    }

    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    /// Ends every open change stream, as a dropped connection would.
    pub fn close_watches(&self) {
        self.lock().watchers.clear();
    }

    pub fn watch_count(&self) -> usize {
        let mut state = self.lock();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }

    /// Makes the next `n` snapshot reads fail with `UNAVAILABLE`.
    pub fn fail_next_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl State {
    fn publish(&mut self, event: KeyEvent) {
        self.watchers.retain(|w| {
            !event.key.starts_with(&w.prefix) || w.tx.send(vec![event.clone()]).is_ok()
        });
        self.history.push(event);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, prefix: &str) -> Result<Snapshot, Error> {
        if self.take_injected_failure() {
            return Err(Error::Status(tonic::Status::unavailable(
                "injected snapshot failure",
            )));
        }
        let state = self.lock();
        let entries = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Snapshot {
            revision: state.revision,
            entries,
        })
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream, Error> {
        let mut state = self.lock();
        if start_revision > 0 && start_revision < state.compacted {
            let compacted = state.compacted;
            return Ok(Box::pin(tokio_stream::once(Err(Error::Compacted(compacted)))));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        // Replay and registration happen under one lock, so no write can
        // fall between them.
        for event in state
            .history
            .iter()
            .filter(|e| e.revision >= start_revision && e.key.starts_with(prefix))
        {
            let _ = tx.send(vec![event.clone()]);
        }
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx).map(Ok::<_, Error>)))
    }
}
