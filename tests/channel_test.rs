//! Request/response round trips over the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tandem_rs::store::{KeyTtl, MemoryStore, Script, Store, Subscription};
use tandem_rs::{ChannelConfig, Client, Coordinator, Error, RequestId, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[tokio::test]
async fn names_follow_the_channel() {
    let coordinator = Coordinator::in_memory();
    let client = coordinator.client("echo");
    let channel = client.channel();
    let id = RequestId::from("abc");

    assert_eq!(channel.name(), "echo");
    assert_eq!(channel.topic(), "channel_response_echo");
    assert_eq!(channel.request_queue().name(), "channel_request_queue_echo");
    assert_eq!(channel.request_key(&id), "channel_request_echo:abc");
    assert_eq!(channel.response_queue_name(&id), "channel_response_queue_echo:abc");
}

#[tokio::test]
async fn request_ids_depend_on_payload_and_ordinal() {
    let coordinator = Coordinator::in_memory();
    let client = coordinator.client("echo");
    let channel = client.channel();

    let a = channel.request_id(b"ping", 1);
    assert_eq!(a, channel.request_id(b"ping", 1));
    assert_ne!(a, channel.request_id(b"ping", 2));
    assert_ne!(a, channel.request_id(b"pong", 1));
    assert_eq!(a.as_str().len(), 64);
}

#[tokio::test]
async fn round_trip_is_byte_exact() {
    let coordinator = Coordinator::in_memory();
    let client = coordinator.client("echo");
    let server = coordinator.server("echo");

    let payload = vec![0u8, 159, 146, 150, 255, b'\n'];
    let id = client.send_req(&payload).await.unwrap();

    let request = server
        .block_recv_req(Some(Duration::from_secs(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.id, id);
    assert_eq!(request.payload, payload);

    let mut response = request.payload.clone();
    response.reverse();
    assert!(server.send_rsp(&request.id, &response).await.unwrap());
    assert!(server.ack_req(&request.id).await.unwrap());

    let got = client
        .block_recv_rsp(&id, Some(Duration::from_secs(1)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, response);
    assert!(client.ack_rsp(&id, &got).await.unwrap());

    let response_queue = client.channel().response_queue(&id);
    assert!(response_queue.is_empty().await.unwrap());
    assert!(client.channel().request_queue().is_empty().await.unwrap());
}

#[tokio::test]
async fn identical_payloads_get_distinct_ids() {
    let coordinator = Coordinator::in_memory();
    let client = coordinator.client("echo");

    let first = client.send_req("same").await.unwrap();
    let second = client.send_req("same").await.unwrap();
    assert_ne!(first, second);
}

#[tokio::test]
async fn responses_never_cross_requests() {
    let coordinator = Coordinator::in_memory();
    let client = coordinator.client("echo");
    let server = coordinator.server("echo");

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(client.send_req(format!("req-{i}")).await.unwrap());
    }

    while let Some(request) = server.recv_req().await.unwrap() {
        let mut response = b"rsp:".to_vec();
        response.extend_from_slice(&request.payload);
        assert!(server.send_rsp(&request.id, response).await.unwrap());
        assert!(server.ack_req(&request.id).await.unwrap());
    }

    // Read back in reverse order; each id still gets its own answer.
    for (i, id) in ids.iter().enumerate().rev() {
        let response = client.recv_rsp(id).await.unwrap().unwrap();
        assert_eq!(response, format!("rsp:req-{i}").into_bytes());
        assert!(client.ack_rsp(id, &response).await.unwrap());
    }
}

#[tokio::test]
async fn recv_without_traffic_returns_none() {
    let coordinator = Coordinator::in_memory();
    let client = coordinator.client("echo");
    let server = coordinator.server("echo");

    assert!(server.recv_req().await.unwrap().is_none());
    assert!(client.recv_rsp(&RequestId::from("nobody")).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn blocking_receives_time_out() {
    let coordinator = Coordinator::in_memory();
    let client = coordinator.client("echo");
    let server = coordinator.server("echo");

    let started = Instant::now();
    let request = server
        .block_recv_req(Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert!(request.is_none());
    assert!(started.elapsed() >= Duration::from_millis(100));

    let id = client.send_req("unanswered").await.unwrap();
    let started = Instant::now();
    let response = client
        .block_recv_rsp(&id, Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert!(response.is_none());
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn client_blocks_until_server_answers() {
    let coordinator = Coordinator::in_memory();
    let client = coordinator.client("echo");
    let server = coordinator.server("echo");

    let serve = tokio::spawn(async move {
        let request = server
            .block_recv_req(Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.send_rsp(&request.id, "pong").await.unwrap();
        server.ack_req(&request.id).await.unwrap();
    });

    let id = client.send_req("ping").await.unwrap();
    let response = client
        .block_recv_rsp(&id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(response.as_deref(), Some(&b"pong"[..]));
    serve.await.unwrap();
}

#[tokio::test]
async fn ack_req_drops_the_payload() {
    let coordinator = Coordinator::in_memory();
    let client = coordinator.client("echo");
    let server = coordinator.server("echo");

    let id = client.send_req("payload").await.unwrap();
    let key = client.channel().request_key(&id);
    assert!(coordinator.store().get(&key).await.unwrap().is_some());

    let request = server.recv_req().await.unwrap().unwrap();
    assert!(server.ack_req(&request.id).await.unwrap());
    assert!(coordinator.store().get(&key).await.unwrap().is_none());
    assert!(!server.ack_req(&request.id).await.unwrap());
}

#[tokio::test]
async fn unacked_request_stays_in_flight() {
    let coordinator = Coordinator::in_memory();
    let client = coordinator.client("echo");
    let server = coordinator.server("echo");

    let id = client.send_req("work").await.unwrap();
    assert!(server.recv_req().await.unwrap().is_some());

    let in_flight = client.channel().request_queue().in_flight().await.unwrap();
    assert_eq!(in_flight, vec![id.as_bytes().to_vec()]);
}

#[tokio::test]
async fn missing_payload_is_reported() {
    let coordinator = Coordinator::in_memory();
    let server = coordinator.server("echo");

    server.channel().request_queue().push("orphan").await.unwrap();
    let result = server.recv_req().await;
    assert!(matches!(result, Err(Error::MissingPayload { ref request_id }) if request_id == "orphan"));

    // The orphaned id can still be cleared from flight.
    assert!(server.ack_req(&RequestId::from("orphan")).await.unwrap());
    assert!(server.channel().request_queue().is_empty().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn expired_payload_is_reported_missing() {
    let coordinator = Coordinator::in_memory().with_channel_config(ChannelConfig {
        request_ttl: Some(Duration::from_millis(30)),
    });
    let client = coordinator.client("echo");
    let server = coordinator.server("echo");

    let id = client.send_req("short-lived").await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let result = server.recv_req().await;
    assert!(matches!(result, Err(Error::MissingPayload { ref request_id }) if request_id == id.as_str()));
}

#[tokio::test]
async fn response_handler_sees_announcements() {
    let coordinator = Coordinator::in_memory();
    let mut client = coordinator.client("echo");
    let server = coordinator.server("echo");

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .set_response_handler(move |id| {
            let _ = tx.send(id);
        })
        .await
        .unwrap();
    assert!(client.channel().is_subscribed());

    let id = client.send_req("ping").await.unwrap();
    let request = server.recv_req().await.unwrap().unwrap();
    server.send_rsp(&request.id, "pong").await.unwrap();

    let notified = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notified, id);

    // The notification is only a hint; the response is still queued.
    let response = client.recv_rsp(&notified).await.unwrap();
    assert_eq!(response.as_deref(), Some(&b"pong"[..]));

    client.close().await;
}

#[tokio::test]
async fn reset_handler_stops_notifications() {
    let coordinator = Coordinator::in_memory();
    let mut client = coordinator.client("echo");
    let server = coordinator.server("echo");

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .set_response_handler(move |id| {
            let _ = tx.send(id);
        })
        .await
        .unwrap();
    client.reset_response_handler().await;
    assert!(!client.channel().is_subscribed());

    let id = client.send_req("ping").await.unwrap();
    server.send_rsp(&id, "pong").await.unwrap();

    // The handler (and with it the sender) is gone, so the channel closes
    // without delivering anything.
    let next = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap();
    assert_eq!(next, None);
}

#[tokio::test]
async fn many_clients_share_one_server() {
    let coordinator = Coordinator::in_memory();
    let server = coordinator.server("echo");

    let serve = tokio::spawn(async move {
        let mut served = 0;
        while let Some(request) = server
            .block_recv_req(Some(Duration::from_millis(300)))
            .await
            .unwrap()
        {
            server.send_rsp(&request.id, &request.payload).await.unwrap();
            server.ack_req(&request.id).await.unwrap();
            served += 1;
        }
        served
    });

    let mut clients = Vec::new();
    for c in 0..4 {
        let client = coordinator.client("echo");
        clients.push(tokio::spawn(async move {
            let mut ids = HashSet::new();
            for i in 0..5 {
                let payload = format!("client-{c}-{i}");
                let id = client.send_req(&payload).await.unwrap();
                let response = client
                    .block_recv_rsp(&id, Some(Duration::from_secs(5)))
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(response, payload.into_bytes());
                client.ack_rsp(&id, &response).await.unwrap();
                ids.insert(id);
            }
            ids
        }));
    }

    let mut all = HashSet::new();
    for client in clients {
        all.extend(client.await.unwrap());
    }
    assert_eq!(all.len(), 20);
    assert_eq!(serve.await.unwrap(), 20);
}

/// Memory store that cannot append to any list, as if the connection
/// dropped between the payload write and the enqueue.
struct NoPushStore {
    inner: MemoryStore,
}

#[async_trait]
impl Store for NoPushStore {
    async fn eval(&self, script: Script, keys: &[&str], args: &[&[u8]]) -> Result<i64> {
        self.inner.eval(script, keys, args).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.inner.ttl(key).await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.inner.incr(key).await
    }

    async fn lpush(&self, _key: &str, _value: &[u8]) -> Result<usize> {
        Err(Error::Other("connection reset".to_string()))
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.inner.llen(key).await
    }

    async fn lrange(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        self.inner.lrange(key).await
    }

    async fn lrem(&self, key: &str, value: &[u8]) -> Result<usize> {
        self.inner.lrem(key, value).await
    }

    async fn blpop(&self, key: &str, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        self.inner.blpop(key, timeout).await
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<Vec<u8>>> {
        self.inner.rpoplpush(source, destination).await
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>> {
        self.inner.brpoplpush(source, destination, timeout).await
    }

    async fn publish(&self, topic: &str, message: &[u8]) -> Result<usize> {
        self.inner.publish(topic, message).await
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.inner.subscribe(topic).await
    }
}

#[tokio::test]
async fn failed_enqueue_is_a_delivery_loss() {
    let store: Arc<dyn Store> = Arc::new(NoPushStore {
        inner: MemoryStore::new(),
    });
    let client = Client::new(Arc::clone(&store), "echo");

    let (request_id, source) = match client.send_req("stranded").await {
        Err(Error::DeliveryLoss { request_id, source }) => (request_id, source),
        other => panic!("expected a delivery loss, got {other:?}"),
    };
    assert!(matches!(*source, Error::Other(ref msg) if msg == "connection reset"));

    // The payload stays behind with nothing pointing at it.
    let id = RequestId(request_id);
    let key = client.channel().request_key(&id);
    assert_eq!(store.get(&key).await.unwrap(), Some(b"stranded".to_vec()));
    assert!(client.channel().request_queue().is_empty().await.unwrap());
}
