//! Error types for etcd-config operations.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC status error: {0}")]
    Status(#[from] tonic::Status),

    #[error("no endpoints configured")]
    NoEndpoints,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("watch canceled by server: {0}")]
    WatchCanceled(String),

    #[error("watch start revision compacted, oldest available is {0}")]
    Compacted(i64),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}
