//! The remote store as seen by the sync engine: a prefix-scoped snapshot
//! read and a prefix-scoped change stream that can start at a revision.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::Error;

/// All entries under a prefix as of one store revision.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub revision: i64,
    pub entries: Vec<(String, String)>,
}

/// A single change. An empty `value` means the key was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub value: String,
    pub revision: i64,
}

impl KeyEvent {
    pub fn is_delete(&self) -> bool {
        self.value.is_empty()
    }
}

/// Batches of events in revision order. The stream ending, or yielding an
/// error, means the subscription is gone and must be re-established.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<Vec<KeyEvent>, Error>> + Send>>;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Reads every entry whose key starts with `prefix`.
    async fn get(&self, prefix: &str) -> Result<Snapshot, Error>;

    /// Subscribes to changes under `prefix`, delivering every event with a
    /// revision of at least `start_revision`.
    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream, Error>;
}
