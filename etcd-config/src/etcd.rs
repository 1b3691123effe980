//! [`Store`] backed by an etcd v3 cluster over gRPC.

use std::time::Duration;

use async_trait::async_trait;
use etcd_config_types::etcdserverpb::kv_client::KvClient;
use etcd_config_types::etcdserverpb::watch_client::WatchClient;
use etcd_config_types::etcdserverpb::watch_request::RequestUnion;
use etcd_config_types::etcdserverpb::{RangeRequest, WatchCreateRequest, WatchRequest};
use etcd_config_types::mvccpb::Event;
use etcd_config_types::mvccpb::event::EventType;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

use crate::Error;
use crate::namespace::prefix_range_end;
use crate::store::{KeyEvent, Snapshot, Store, WatchStream};

const RANGE_PAGE_SIZE: i64 = 1000;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection to one etcd member.
///
/// Snapshot reads are paged and pinned to the revision of the first page, so
/// a large namespace still loads as one consistent view. Watches keep their
/// request half open for as long as the returned stream lives.
#[derive(Clone)]
pub struct EtcdStore {
    kv: KvClient<Channel>,
    watch: WatchClient<Channel>,
    request_timeout: Duration,
}

impl EtcdStore {
    /// Dials each endpoint in turn and keeps the first one that answers
    /// within `dial_timeout`.
    ///
    /// Endpoints without a scheme are treated as plain `http://` addresses,
    /// so `"localhost:2379"` works as-is.
    pub async fn connect(
        endpoints: &[String],
        dial_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, Error> {
        let mut last_error = None;

        for addr in endpoints {
            let endpoint = Endpoint::from_shared(endpoint_url(addr))?
                .connect_timeout(dial_timeout)
                .http2_keep_alive_interval(KEEP_ALIVE_INTERVAL)
                .keep_alive_timeout(KEEP_ALIVE_TIMEOUT)
                .keep_alive_while_idle(true);

            match tokio::time::timeout(dial_timeout, endpoint.connect()).await {
                Ok(Ok(channel)) => {
                    info!(endpoint = %addr, "connected to etcd");
                    return Ok(Self::from_channel(channel, request_timeout));
                }
                Ok(Err(e)) => {
                    warn!(endpoint = %addr, error = %e, "etcd endpoint unreachable");
                    last_error = Some(Error::Transport(e));
                }
                Err(_) => {
                    warn!(endpoint = %addr, "etcd dial timed out");
                    last_error = Some(Error::Timeout(dial_timeout));
                }
            }
        }

        Err(last_error.unwrap_or(Error::NoEndpoints))
    }

    pub fn from_channel(channel: Channel, request_timeout: Duration) -> Self {
        Self {
            kv: KvClient::new(channel.clone()),
            watch: WatchClient::new(channel),
            request_timeout,
        }
    }

    async fn with_timeout<F, T>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<tonic::Response<T>, tonic::Status>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(response) => Ok(response?.into_inner()),
            Err(_) => Err(Error::Timeout(self.request_timeout)),
        }
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn get(&self, prefix: &str) -> Result<Snapshot, Error> {
        let range_end = prefix_range_end(prefix.as_bytes());
        let mut key = prefix.as_bytes().to_vec();
        let mut snapshot = Snapshot::default();

        loop {
            let request = RangeRequest {
                key: key.clone(),
                range_end: range_end.clone(),
                limit: RANGE_PAGE_SIZE,
                revision: snapshot.revision,
                ..Default::default()
            };
            let mut client = self.kv.clone();
            let response = self.with_timeout(client.range(request)).await?;

            if snapshot.revision == 0 {
                snapshot.revision = response.header.map(|h| h.revision).unwrap_or_default();
            }

            let more = response.more;
            let next_key = response.kvs.last().map(|kv| {
                let mut next = kv.key.clone();
                next.push(0);
                next
            });
            snapshot.entries.extend(
                response
                    .kvs
                    .into_iter()
                    .map(|kv| (lossy(&kv.key), lossy(&kv.value))),
            );

            match next_key {
                Some(next) if more => key = next,
                _ => break,
            }
        }

        Ok(snapshot)
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream, Error> {
        let (tx, rx) = mpsc::channel(1);
        let create = WatchRequest {
            request_union: Some(RequestUnion::CreateRequest(WatchCreateRequest {
                key: prefix.as_bytes().to_vec(),
                range_end: prefix_range_end(prefix.as_bytes()),
                start_revision,
                ..Default::default()
            })),
        };
        tx.send(create).await.map_err(|_| Error::ConnectionClosed)?;

        let mut client = self.watch.clone();
        let mut responses = self
            .with_timeout(client.watch(ReceiverStream::new(rx)))
            .await?;

        let stream = async_stream::stream! {
            // etcd tears the watch down once the request side closes.
            let _requests = tx;
            loop {
                match responses.message().await {
                    Ok(Some(response)) => {
                        if response.compact_revision != 0 {
                            yield Err(Error::Compacted(response.compact_revision));
                            break;
                        }
                        if response.canceled {
                            yield Err(Error::WatchCanceled(response.cancel_reason));
                            break;
                        }
                        if response.events.is_empty() {
                            continue;
                        }
                        let events: Vec<KeyEvent> =
                            response.events.into_iter().filter_map(key_event).collect();
                        yield Ok(events);
                    }
                    Ok(None) => break,
                    Err(status) => {
                        yield Err(Error::Status(status));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn key_event(event: Event) -> Option<KeyEvent> {
    let kind = event.r#type();
    let kv = event.kv?;
    let value = match kind {
        EventType::Delete => String::new(),
        EventType::Put => lossy(&kv.value),
    };
    Some(KeyEvent {
        key: lossy(&kv.key),
        value,
        revision: kv.mod_revision,
    })
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn endpoint_url(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}
