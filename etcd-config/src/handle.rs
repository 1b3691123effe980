//! The public handle: a read-only, continuously synchronized view of one
//! namespace.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Error;
use crate::cache::Cache;
use crate::config::Settings;
use crate::etcd::EtcdStore;
use crate::namespace::Namespace;
use crate::store::Store;
use crate::sync::{SyncState, SyncTask};

/// A live copy of every key under `{namespace}/` in the store.
///
/// Construction blocks until the first snapshot is in the cache, so a
/// returned handle never shows a partially loaded namespace. After that a
/// background task applies the change stream and silently reconnects after
/// outages; reads never touch the network and never fail. During an outage
/// they return the last known values.
///
/// Clones share the same cache and task. The task stops when
/// [`shutdown`](Self::shutdown) is called or the last clone is dropped.
///
/// # Example
///
/// ```no_run
/// use etcd_config::EtcdConfig;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = EtcdConfig::new(["localhost:2379"], "foo").await?;
///
///     println!("config bar is {}", config.get("bar"));
///     println!("{config}");
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct EtcdConfig {
    inner: Arc<EtcdConfigInner>,
}

struct EtcdConfigInner {
    cache: Arc<Cache>,
    namespace: Namespace,
    revision: Arc<AtomicI64>,
    state: watch::Receiver<SyncState>,
    shutdown: CancellationToken,
    sync_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdConfig {
    /// Connects to etcd with default timeouts and loads `namespace`.
    pub async fn new<I, S>(endpoints: I, namespace: impl Into<String>) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::connect(Settings::new(endpoints, namespace)).await
    }

    pub async fn connect(settings: Settings) -> Result<Self, Error> {
        if settings.endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }
        let store = EtcdStore::connect(
            &settings.endpoints,
            settings.dial_timeout,
            settings.request_timeout,
        )
        .await?;
        Self::with_store(Arc::new(store), settings).await
    }

    /// Loads the namespace from an arbitrary [`Store`] and starts syncing.
    ///
    /// On error the store is dropped with everything else and no task is
    /// left running.
    pub async fn with_store(store: Arc<dyn Store>, settings: Settings) -> Result<Self, Error> {
        let namespace = Namespace::new(settings.namespace);
        let cache = Arc::new(Cache::new());
        let revision = Arc::new(AtomicI64::new(0));
        let (state_tx, state) = watch::channel(SyncState::Loading);
        let shutdown = CancellationToken::new();

        let sync_task = SyncTask::new(
            store,
            namespace.clone(),
            Arc::clone(&cache),
            Arc::clone(&revision),
            state_tx,
            settings.retry_delay,
            shutdown.clone(),
        );

        let stream = sync_task.init_and_watch().await.inspect_err(|e| {
            error!(namespace = namespace.name(), error = %e, "initial load failed");
        })?;

        let sync_handle = tokio::spawn(sync_task.run(stream));
        info!(namespace = namespace.name(), "watching namespace");

        Ok(Self {
            inner: Arc::new(EtcdConfigInner {
                cache,
                namespace,
                revision,
                state,
                shutdown,
                sync_handle: Mutex::new(Some(sync_handle)),
            }),
        })
    }

    /// Returns the value for `key`, or an empty string if it is not set.
    pub fn get(&self, key: &str) -> String {
        self.inner.cache.get(key).unwrap_or_default()
    }

    /// Like [`get`](Self::get), but tells an unset key apart.
    pub fn lookup(&self, key: &str) -> Option<String> {
        self.inner.cache.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.cache.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cache.is_empty()
    }

    /// Copies every entry, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner.cache.snapshot()
    }

    pub fn namespace(&self) -> &str {
        self.inner.namespace.name()
    }

    /// The store revision the cache reflects.
    pub fn revision(&self) -> i64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SyncState {
        *self.inner.state.borrow()
    }

    /// Waits until the sync task reports `target`. Returns immediately if it
    /// already does.
    pub async fn wait_for_state(&self, target: SyncState) {
        let mut state = self.inner.state.clone();
        // Only fails once the task is gone, which nothing can change.
        let _ = state.wait_for(|s| *s == target).await;
    }

    /// Stops the sync task and waits for it to finish. The cache keeps its
    /// last contents and stays readable.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self
            .inner
            .sync_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "sync task panicked");
            }
        }
    }
}

impl Drop for EtcdConfigInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Pretty-printed JSON object with sorted keys.
impl fmt::Display for EtcdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string_pretty(&self.snapshot()).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

impl fmt::Debug for EtcdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdConfig")
            .field("namespace", &self.namespace())
            .field("revision", &self.revision())
            .field("state", &self.state())
            .field("len", &self.len())
            .finish()
    }
}
