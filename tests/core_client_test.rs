/// Integration tests for the TCP core client
///
/// A mock core answers frames on a loopback socket by delegating every call
/// to the in-process core and forwarding its events as event frames.

use serde_json::{json, Value};
use sessionproxy::client::config::CoreConfig;
use sessionproxy::client::{CoreClient, RpcError};
use sessionproxy::codec::frame::{Call, EventFrame, Frame, KeepAliveFrame, RequestFrame, ResponseFrame};
use sessionproxy::network::tcp_connection::TcpConnection;
use sessionproxy::network::Connection;
use sessionproxy::proxy::{CacheConfig, StatusCache, StatusDict, StatusFilter};
use sessionproxy::rpc::memory::InMemoryCore;
use sessionproxy::rpc::{EventKind, RemoteClient};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

fn session(name: &str, state: &str) -> StatusDict {
    HashMap::from([
        ("name".to_string(), json!(name)),
        ("state".to_string(), json!(state)),
    ])
}

fn core_with(ids: &[&str]) -> Arc<InMemoryCore> {
    Arc::new(InMemoryCore::with_sessions(
        ids.iter()
            .map(|id| (id.to_string(), session(&format!("{} name", id), "Downloading"))),
    ))
}

async fn answer(core: &InMemoryCore, request: RequestFrame) -> ResponseFrame {
    let result: sessionproxy::Result<Value> = match request.call {
        Call::GetSessionIds => core.fetch_session_ids().await.map(|ids| json!(ids)),
        Call::GetStatus { filter, fields, diff } => core
            .fetch_status(&filter, &fields, diff)
            .await
            .map(|status| json!(status)),
        Call::GetEntityStatus { id, fields, diff } => core
            .fetch_entity_status(&id, &fields, diff)
            .await
            .map(|status| json!(status)),
    };
    match result {
        Ok(value) => ResponseFrame::ok(request.id, value),
        Err(e) => ResponseFrame::err(request.id, e.to_string()),
    }
}

/// Serve one connection on behalf of `core`
async fn serve_core(core: Arc<InMemoryCore>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut conn = TcpConnection::new(socket);
        let (tx, mut events) = mpsc::unbounded_channel();
        for kind in EventKind::ALL {
            core.subscribe(kind, tx.clone());
        }

        loop {
            tokio::select! {
                frame = conn.read_frame() => {
                    let Ok(frame) = frame else {
                        break;
                    };
                    let reply = match frame {
                        Frame::Request(request) => Frame::Response(answer(&core, request).await),
                        Frame::KeepAlive(_) => Frame::KeepAlive(KeepAliveFrame {}),
                        _ => continue,
                    };
                    if conn.write_frame(reply).await.is_err() {
                        break;
                    }
                }
                Some(event) = events.recv() => {
                    if conn.write_frame(Frame::Event(EventFrame { event })).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    (addr, handle)
}

/// Accept one connection and read one frame without ever answering it
async fn serve_silent(hang_up: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut conn = TcpConnection::new(socket);
        let _ = conn.read_frame().await;
        if hang_up {
            conn.close().await;
            return;
        }
        sleep(Duration::from_secs(30)).await;
    });
    addr
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_calls_over_tcp() {
    let core = core_with(&["t1", "t2"]);
    let (addr, _server) = serve_core(core.clone()).await;
    let client = CoreClient::connect(&CoreConfig::new(addr)).await.unwrap();

    assert_eq!(client.fetch_session_ids().await.unwrap(), vec!["t1", "t2"]);

    let status = client
        .fetch_status(&StatusFilter::by_ids(vec!["t1".to_string()]), &["name".to_string()], false)
        .await
        .unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status["t1"], HashMap::from([("name".to_string(), json!("t1 name"))]));

    let entity = client.fetch_entity_status("t2", &[], false).await.unwrap();
    assert_eq!(entity, session("t2 name", "Downloading"));

    let err = client.fetch_entity_status("ghost", &[], false).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<RpcError>(), Some(RpcError::Remote(_))));
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_concurrent_calls_share_connection() {
    let core = core_with(&["t1", "t2", "t3"]);
    let (addr, _server) = serve_core(core.clone()).await;
    let client = Arc::new(CoreClient::connect(&CoreConfig::new(addr)).await.unwrap());

    let mut tasks = Vec::new();
    for id in ["t1", "t2", "t3"] {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.fetch_entity_status(id, &["name".to_string()], false).await
        }));
    }
    for (task, id) in tasks.into_iter().zip(["t1", "t2", "t3"]) {
        let status = task.await.unwrap().unwrap();
        assert_eq!(status["name"], json!(format!("{} name", id)));
    }
}

#[tokio::test]
async fn test_events_reach_subscribers() {
    let core = core_with(&["t1"]);
    let (addr, _server) = serve_core(core.clone()).await;
    let client = CoreClient::connect(&CoreConfig::new(addr)).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let removed = client.subscribe(EventKind::Removed, tx.clone());
    client.subscribe(EventKind::StateChanged, tx);

    // the mock subscribes once its accept completes
    wait_until(|| core.subscriber_count(EventKind::Removed) == 1).await;

    core.set_state("t1", "Paused");
    let event = rx.recv().await.unwrap();
    assert_eq!(event.kind(), EventKind::StateChanged);
    assert_eq!(event.id(), "t1");

    client.unsubscribe(EventKind::Removed, removed);
    core.remove_session("t1");
    core.add_session("t2", session("t2 name", "Queued"));
    core.set_state("t2", "Downloading");

    let event = rx.recv().await.unwrap();
    assert_eq!(event.kind(), EventKind::StateChanged);
    assert_eq!(event.id(), "t2");
}

#[tokio::test]
async fn test_cache_over_tcp() {
    let core = core_with(&["t1", "t2"]);
    let (addr, _server) = serve_core(core.clone()).await;
    let client = Arc::new(CoreClient::connect(&CoreConfig::new(addr)).await.unwrap());

    let cache = StatusCache::new(client.clone(), CacheConfig::default());
    cache.start().await.unwrap();
    assert_eq!(cache.ids(), vec!["t1", "t2"]);
    wait_until(|| core.subscriber_count(EventKind::Added) == 1).await;

    core.add_session("t3", session("t3 name", "Queued"));
    wait_until(|| cache.entry("t3").is_some_and(|entry| !entry.is_empty())).await;

    core.set_state("t1", "Paused");
    wait_until(|| cache.entry("t1").and_then(|e| e.get("state").cloned()) == Some(json!("Paused"))).await;

    core.remove_session("t2");
    wait_until(|| cache.entry("t2").is_none()).await;

    let status = cache.query_one("t3", None).await.unwrap();
    assert_eq!(status, session("t3 name", "Queued"));
    cache.stop();
}

#[tokio::test]
async fn test_disconnect_fails_pending_calls() {
    let addr = serve_silent(true).await;
    let client = CoreClient::connect(&CoreConfig::new(addr)).await.unwrap();

    let err = client.call(Call::GetSessionIds).await.unwrap_err();
    assert_eq!(err, RpcError::Disconnected);

    wait_until(|| !client.is_connected()).await;
    let err = client.call(Call::GetSessionIds).await.unwrap_err();
    assert_eq!(err, RpcError::Disconnected);
}

#[tokio::test]
async fn test_request_timeout() {
    let addr = serve_silent(false).await;
    let mut config = CoreConfig::new(addr);
    config.request_timeout_secs = 1;
    let client = CoreClient::connect(&config).await.unwrap();

    let err = client.call(Call::GetSessionIds).await.unwrap_err();
    assert_eq!(err, RpcError::Timeout);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    assert!(CoreClient::connect(&CoreConfig::new(addr)).await.is_err());
}
