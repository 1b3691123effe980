use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use etcd_config::{EtcdConfig, EtcdStore, Error, Settings, Store, SyncState};
use etcd_config_types::etcdserverpb::kv_server::{Kv, KvServer};
use etcd_config_types::etcdserverpb::watch_request::RequestUnion;
use etcd_config_types::etcdserverpb::watch_server::{Watch, WatchServer};
use etcd_config_types::etcdserverpb::{
    RangeRequest, RangeResponse, ResponseHeader, WatchRequest, WatchResponse,
};
use etcd_config_types::mvccpb::event::EventType;
use etcd_config_types::mvccpb::{Event, KeyValue};
use futures_util::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::wrappers::{TcpListenerStream, UnboundedReceiverStream};
use tonic::{Request, Response, Status, Streaming};

type Responder = mpsc::UnboundedSender<Result<WatchResponse, Status>>;

struct Watcher {
    key: Vec<u8>,
    range_end: Vec<u8>,
    tx: Responder,
}

#[derive(Default)]
struct FakeState {
    revision: i64,
    compacted: i64,
    data: BTreeMap<Vec<u8>, KeyValue>,
    history: Vec<Event>,
    watchers: Vec<Watcher>,
}

impl FakeState {
    fn header(&self) -> Option<ResponseHeader> {
        Some(ResponseHeader {
            revision: self.revision,
            ..Default::default()
        })
    }

    fn record(&mut self, event: Event) {
        let header = self.header();
        let key = event.kv.as_ref().map(|kv| kv.key.clone()).unwrap_or_default();
        self.watchers.retain(|w| {
            if !in_range(&key, &w.key, &w.range_end) {
                return true;
            }
            w.tx.send(Ok(WatchResponse {
                header: header.clone(),
                events: vec![event.clone()],
                ..Default::default()
            }))
            .is_ok()
        });
        self.history.push(event);
    }
}

/// Just enough of etcd's KV and Watch services to drive the client.
#[derive(Clone, Default)]
struct FakeEtcd {
    state: Arc<Mutex<FakeState>>,
}

impl FakeEtcd {
    fn put(&self, key: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        state.revision += 1;
        let kv = KeyValue {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
            mod_revision: state.revision,
            ..Default::default()
        };
        state.data.insert(kv.key.clone(), kv.clone());
        state.record(Event {
            r#type: EventType::Put as i32,
            kv: Some(kv),
            prev_kv: None,
        });
    }

    fn delete(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if state.data.remove(key.as_bytes()).is_none() {
            return;
        }
        state.revision += 1;
        let kv = KeyValue {
            key: key.as_bytes().to_vec(),
            mod_revision: state.revision,
            ..Default::default()
        };
        state.record(Event {
            r#type: EventType::Delete as i32,
            kv: Some(kv),
            prev_kv: None,
        });
    }

    fn compact(&self, revision: i64) {
        self.state.lock().unwrap().compacted = revision;
    }

    fn drop_watches(&self) {
        self.state.lock().unwrap().watchers.clear();
    }

    fn watch_count(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }
}

fn in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    if end.is_empty() {
        return key == start;
    }
    key >= start && (end == [0] || key < end)
}

#[tonic::async_trait]
impl Kv for FakeEtcd {
    async fn range(
        &self,
        request: Request<RangeRequest>,
    ) -> Result<Response<RangeResponse>, Status> {
        let req = request.into_inner();
        let state = self.state.lock().unwrap();

        let matching: Vec<KeyValue> = state
            .data
            .values()
            .filter(|kv| in_range(&kv.key, &req.key, &req.range_end))
            .cloned()
            .collect();
        let count = matching.len() as i64;
        let limit = if req.limit > 0 {
            req.limit as usize
        } else {
            matching.len()
        };
        let more = matching.len() > limit;
        let kvs = matching.into_iter().take(limit).collect();

        Ok(Response::new(RangeResponse {
            header: state.header(),
            kvs,
            more,
            count,
        }))
    }
}

type FakeWatchStream = Pin<Box<dyn Stream<Item = Result<WatchResponse, Status>> + Send>>;

#[tonic::async_trait]
impl Watch for FakeEtcd {
    type WatchStream = FakeWatchStream;

    async fn watch(
        &self,
        request: Request<Streaming<WatchRequest>>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let mut requests = request.into_inner();
        let create = match requests.message().await? {
            Some(WatchRequest {
                request_union: Some(RequestUnion::CreateRequest(create)),
            }) => create,
            _ => return Err(Status::invalid_argument("expected a create request")),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().unwrap();
            let header = state.header();

            if create.start_revision > 0 && create.start_revision < state.compacted {
                let _ = tx.send(Ok(WatchResponse {
                    header,
                    created: true,
                    canceled: true,
                    compact_revision: state.compacted,
                    cancel_reason: "required revision has been compacted".to_string(),
                    ..Default::default()
                }));
            } else {
                let _ = tx.send(Ok(WatchResponse {
                    header: header.clone(),
                    created: true,
                    ..Default::default()
                }));
                for event in state.history.iter().filter(|e| {
                    let kv = e.kv.as_ref().expect("events carry a kv");
                    kv.mod_revision >= create.start_revision
                        && in_range(&kv.key, &create.key, &create.range_end)
                }) {
                    let _ = tx.send(Ok(WatchResponse {
                        header: header.clone(),
                        events: vec![event.clone()],
                        ..Default::default()
                    }));
                }
                state.watchers.push(Watcher {
                    key: create.key,
                    range_end: create.range_end,
                    tx,
                });
            }
        }

        Ok(Response::new(Box::pin(UnboundedReceiverStream::new(rx))))
    }
}

async fn start_fake_etcd(fake: FakeEtcd) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(KvServer::new(fake.clone()))
            .add_service(WatchServer::new(fake))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    sleep(Duration::from_millis(100)).await;
    (addr, handle)
}

fn settings(addr: SocketAddr) -> Settings {
    Settings::new([addr.to_string()], "foo")
        .with_dial_timeout(Duration::from_secs(2))
        .with_retry_delay(Duration::from_millis(20))
}

async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..300 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_put_update_delete_scenario() {
    let fake = FakeEtcd::default();
    fake.put("foo/bar", "1");
    let (addr, _handle) = start_fake_etcd(fake.clone()).await;

    let config = EtcdConfig::connect(settings(addr)).await.unwrap();
    assert_eq!(config.get("bar"), "1");
    assert_eq!(config.revision(), 1);

    fake.put("foo/bar", "2");
    eventually(|| config.get("bar") == "2").await;

    fake.delete("foo/bar");
    eventually(|| !config.contains_key("bar")).await;
    assert_eq!(config.get("bar"), "");
    assert_eq!(config.revision(), 3);

    config.shutdown().await;
}

#[tokio::test]
async fn test_foreign_prefixes_never_enter_cache() {
    let fake = FakeEtcd::default();
    fake.put("foo/a", "1");
    fake.put("foobar/b", "2");
    fake.put("fo/c", "3");
    let (addr, _handle) = start_fake_etcd(fake.clone()).await;

    let config = EtcdConfig::connect(settings(addr)).await.unwrap();
    fake.put("foox/d", "4");
    fake.put("other/e", "5");
    fake.put("foo/f", "6");
    eventually(|| config.contains_key("f")).await;

    let keys: Vec<String> = config.snapshot().into_keys().collect();
    assert_eq!(keys, vec!["a", "f"]);
}

#[tokio::test]
async fn test_reconnects_after_watch_is_dropped() {
    let fake = FakeEtcd::default();
    fake.put("foo/a", "1");
    fake.put("foo/old", "x");
    let (addr, _handle) = start_fake_etcd(fake.clone()).await;

    let config = EtcdConfig::connect(settings(addr)).await.unwrap();
    assert_eq!(fake.watch_count(), 1);

    fake.drop_watches();
    fake.put("foo/a", "2");
    fake.delete("foo/old");

    eventually(|| config.get("a") == "2" && !config.contains_key("old")).await;
    tokio::time::timeout(
        Duration::from_secs(2),
        config.wait_for_state(SyncState::Watching),
    )
    .await
    .unwrap();
    eventually(|| fake.watch_count() == 1).await;

    fake.put("foo/a", "3");
    eventually(|| config.get("a") == "3").await;
}

#[tokio::test]
async fn test_large_namespace_loads_across_pages() {
    let fake = FakeEtcd::default();
    for i in 0..2500 {
        fake.put(&format!("foo/key-{i:04}"), &i.to_string());
    }
    let (addr, _handle) = start_fake_etcd(fake.clone()).await;

    let config = EtcdConfig::connect(settings(addr)).await.unwrap();
    assert_eq!(config.len(), 2500);
    assert_eq!(config.get("key-0000"), "0");
    assert_eq!(config.get("key-2499"), "2499");
    assert_eq!(config.revision(), 2500);
}

#[tokio::test]
async fn test_compacted_start_revision_ends_stream() {
    let fake = FakeEtcd::default();
    for i in 0..5 {
        fake.put("foo/a", &i.to_string());
    }
    fake.compact(4);
    let (addr, _handle) = start_fake_etcd(fake.clone()).await;

    let store = EtcdStore::connect(
        &[addr.to_string()],
        Duration::from_secs(2),
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    let mut stream = store.watch("foo/", 1).await.unwrap();

    match stream.next().await {
        Some(Err(Error::Compacted(revision))) => assert_eq!(revision, 4),
        other => panic!("expected compaction error, got {other:?}"),
    }
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_construction() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = EtcdConfig::connect(
        Settings::new([addr.to_string()], "foo").with_dial_timeout(Duration::from_millis(500)),
    )
    .await;
    assert!(matches!(
        result,
        Err(Error::Transport(_)) | Err(Error::Timeout(_))
    ));
}
