//! A live, in-memory view of an etcd key namespace.
//!
//! `etcd-config` loads every key under `{namespace}/` into a local map and
//! keeps it current through an etcd watch, so configuration reads are local
//! lookups that still observe writes made elsewhere.
//!
//! # Features
//!
//! - Snapshot load and watch joined by revision, so no change is missed or
//!   applied twice
//! - Automatic re-load and re-watch after any stream disruption, retried at a
//!   fixed interval
//! - Lock-guarded cache with many concurrent readers and a single writer
//! - Graceful shutdown of the background task
//! - Pluggable [`Store`] with an etcd gRPC implementation and an in-memory one
//!
//! # Example
//!
//! ```no_run
//! use etcd_config::EtcdConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EtcdConfig::new(["localhost:2379"], "foo").await?;
//!
//!     println!("bar = {}", config.get("bar"));
//!     println!("{config}");
//!
//!     config.shutdown().await;
//!     Ok(())
//! }
//! ```

mod cache;
mod config;
mod error;
mod etcd;
mod handle;
pub mod memory;
mod namespace;
pub mod store;
mod sync;

pub use config::{Settings, parse_endpoints};
pub use error::Error;
pub use etcd::EtcdStore;
pub use handle::EtcdConfig;
pub use memory::MemoryStore;
pub use namespace::{Namespace, prefix_range_end};
pub use store::{KeyEvent, Snapshot, Store, WatchStream};
pub use sync::SyncState;
