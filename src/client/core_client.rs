//! TCP client for the session core
//!
//! A single I/O task owns the connection. Callers hand it request frames over
//! a channel and wait on a oneshot keyed by the request id; events read from
//! the connection are fanned out to the subscribers of their kind.

use crate::client::config::CoreConfig;
use crate::client::errors::RpcError;
use crate::codec::frame::{Call, EventFrame, Frame, KeepAliveFrame, RequestFrame, ResponseFrame};
use crate::network::{create_connection, Connection};
use crate::proxy::status::{StatusDict, StatusFilter, StatusMap};
use crate::rpc::{CoreEvent, EventHandler, EventKind, RemoteClient, SubscriptionId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};

const OUTBOUND_BUFFER_SIZE: usize = 1000;

type Reply = Result<Value, RpcError>;

#[derive(Default)]
struct Shared {
    /// request id -> waiting caller
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    subscribers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>>,
    connected: AtomicBool,
}

impl Shared {
    fn complete(&self, response: ResponseFrame) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&response.id);
        let Some(waiter) = waiter else {
            tracing::debug!("response #{} has no waiting caller", response.id);
            return;
        };

        let reply = match (response.error, response.result) {
            (Some(msg), _) => Err(RpcError::Remote(msg)),
            (None, Some(value)) => Ok(value),
            (None, None) => Ok(Value::Null),
        };
        let _ = waiter.send(reply);
    }

    fn dispatch(&self, event: CoreEvent) {
        let kind = event.kind();
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let Some(handlers) = subscribers.get_mut(&kind) else {
            return;
        };
        handlers.retain(|(id, handler)| {
            let delivered = handler.send(event.clone()).is_ok();
            if !delivered {
                tracing::debug!("dropping closed {} subscriber {}", kind, id);
            }
            delivered
        });
    }

    fn fail_pending(&self) {
        let pending: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        if !pending.is_empty() {
            tracing::warn!("failing {} pending core requests", pending.len());
        }
        for (_, waiter) in pending {
            let _ = waiter.send(Err(RpcError::Disconnected));
        }
    }
}

/// [`RemoteClient`] speaking the frame protocol over one TCP connection
///
/// The connection is not re-established; once it drops every call fails with
/// [`RpcError::Disconnected`].
pub struct CoreClient {
    next_request: AtomicU64,
    next_subscription: AtomicU64,
    request_timeout: Duration,
    outbound_tx: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
    io_task: JoinHandle<()>,
}

impl CoreClient {
    /// Connect to the core at `cfg.addr`
    pub async fn connect(cfg: &CoreConfig) -> crate::Result<Self> {
        let conn = create_connection(&cfg.addr, cfg.connect_timeout()).await?;
        tracing::info!("Connected to core {}", cfg.addr);
        Ok(Self::with_connection(conn, cfg))
    }

    /// Run the client over an established connection
    pub fn with_connection(conn: Box<dyn Connection>, cfg: &CoreConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
        let shared = Arc::new(Shared::default());
        shared.connected.store(true, Ordering::SeqCst);

        let io_task = tokio::spawn(run_io(
            conn,
            outbound_rx,
            shared.clone(),
            cfg.keepalive_interval(),
            cfg.keep_alive_thresh,
        ));

        Self {
            next_request: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
            request_timeout: cfg.request_timeout(),
            outbound_tx,
            shared,
            io_task,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Issue one call and wait for its response
    pub async fn call(&self, call: Call) -> Result<Value, RpcError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        tracing::debug!("core request #{} {}", id, call.method());
        if self.outbound_tx.send(Frame::Request(RequestFrame { id, call })).await.is_err() {
            self.forget(id);
            return Err(RpcError::Disconnected);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RpcError::Disconnected),
            Err(_) => {
                self.forget(id);
                Err(RpcError::Timeout)
            }
        }
    }

    async fn call_as<T: DeserializeOwned + Default>(&self, call: Call) -> Result<T, RpcError> {
        let value = self.call(call).await?;
        if value.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(value).map_err(|e| RpcError::Decode(e.to_string()))
    }

    fn forget(&self, id: u64) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

impl Drop for CoreClient {
    fn drop(&mut self) {
        self.io_task.abort();
    }
}

#[async_trait]
impl RemoteClient for CoreClient {
    async fn fetch_status(
        &self,
        filter: &StatusFilter,
        fields: &[String],
        diff: bool,
    ) -> crate::Result<StatusMap> {
        let status: StatusMap = self
            .call_as(Call::GetStatus {
                filter: filter.clone(),
                fields: fields.to_vec(),
                diff,
            })
            .await?;
        Ok(status)
    }

    async fn fetch_entity_status(
        &self,
        id: &str,
        fields: &[String],
        diff: bool,
    ) -> crate::Result<StatusDict> {
        let status: StatusDict = self
            .call_as(Call::GetEntityStatus {
                id: id.to_string(),
                fields: fields.to_vec(),
                diff,
            })
            .await?;
        Ok(status)
    }

    async fn fetch_session_ids(&self) -> crate::Result<Vec<String>> {
        let ids: Vec<String> = self.call_as(Call::GetSessionIds).await?;
        Ok(ids)
    }

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) {
        let mut subscribers = self.shared.subscribers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(handlers) = subscribers.get_mut(&kind) {
            handlers.retain(|(sub, _)| *sub != id);
        }
    }
}

async fn run_io(
    mut conn: Box<dyn Connection>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
    keepalive_interval: Duration,
    keep_alive_thresh: u8,
) {
    let mut keepalive_ticker = interval(keepalive_interval);
    keepalive_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive_ticker.tick().await;
    let mut keepalive_wait: u8 = 0;

    loop {
        tokio::select! {
            _ = keepalive_ticker.tick() => {
                match conn.write_frame(Frame::KeepAlive(KeepAliveFrame {})).await {
                    Ok(_) => {
                        keepalive_wait = 0;
                    }
                    Err(e) => {
                        tracing::error!("Failed to send keepalive: {}", e);
                        keepalive_wait += 1;
                        if keepalive_wait > keep_alive_thresh {
                            tracing::error!("keepalive max retry, close connection");
                            break;
                        }
                    }
                }
            }

            // inbound
            result = conn.read_frame() => {
                match result {
                    Ok(frame) => {
                        tracing::debug!("received frame {}", frame);
                        let beg = Instant::now();
                        match frame {
                            Frame::Response(response) => shared.complete(response),
                            Frame::Event(EventFrame { event }) => shared.dispatch(event),
                            Frame::KeepAlive(_) => {
                                keepalive_wait = keepalive_wait.saturating_sub(1);
                            }
                            Frame::Request(request) => {
                                tracing::warn!("unexpected request #{} from core", request.id);
                            }
                        }
                        tracing::debug!("handle frame cost {}", beg.elapsed().as_millis());
                    }
                    Err(e) => {
                        tracing::error!("Read error: {}", e);
                        break;
                    }
                }
            }

            // outbound
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    tracing::debug!("core client dropped");
                    break;
                };
                if let Err(e) = conn.write_frame(frame).await {
                    tracing::error!("proxy => core write frame: {}", e);
                    break;
                }
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    // nothing queued after this point can reach the core
    outbound_rx.close();
    drop(outbound_rx);
    shared.fail_pending();

    tracing::info!("core disconnected");
    conn.close().await;
}
