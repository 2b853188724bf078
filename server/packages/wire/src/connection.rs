use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use acp_bridge_error::{
    BridgeError, CapabilityError, ProtocolError, RpcErrorObject, PARSE_ERROR,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{oneshot, watch, Mutex};

use crate::message::{id_key, Message};

const INITIALIZE: &str = "initialize";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to spawn subprocess `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to capture subprocess {stream}")]
    MissingStdio { stream: &'static str },
    #[error("failed to serialize json-rpc message: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to decode result of {method}: {message}")]
    Decode { method: String, message: String },
    #[error("failed to write frame: {0}")]
    Write(std::io::Error),
    #[error("timeout waiting for response to {method}")]
    Timeout { method: String },
    #[error("connection closed")]
    Closed,
    #[error("peer returned error {}: {}", .0.code, .0.message)]
    Rpc(RpcErrorObject),
}

impl From<WireError> for ProtocolError {
    fn from(value: WireError) -> Self {
        match value {
            WireError::Rpc(error) => ProtocolError::from(error),
            other => ProtocolError::Remote {
                code: acp_bridge_error::INTERNAL_ERROR,
                message: other.to_string(),
                data: None,
            },
        }
    }
}

impl From<WireError> for CapabilityError {
    fn from(value: WireError) -> Self {
        match value {
            WireError::Rpc(error) => CapabilityError::from(ProtocolError::from(error)),
            WireError::Timeout { method } => CapabilityError::Timeout { operation: method },
            WireError::Write(err) => CapabilityError::Io {
                message: err.to_string(),
            },
            other => CapabilityError::Remote {
                message: other.to_string(),
            },
        }
    }
}

impl From<WireError> for BridgeError {
    fn from(value: WireError) -> Self {
        match value {
            WireError::Rpc(error) => BridgeError::Protocol(ProtocolError::from(error)),
            WireError::Closed | WireError::Timeout { .. } | WireError::Write(_) => {
                BridgeError::Capability(CapabilityError::from(value))
            }
            other => BridgeError::internal(other.to_string()),
        }
    }
}

/// Serves inbound traffic for one side of a connection.
///
/// Requests run on their own task. Notifications are handled inline on the
/// read loop so that their order is preserved; a notification handler must not
/// wait on a response from the same peer.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, BridgeError>;

    async fn handle_notification(&self, method: &str, params: Value) -> Result<(), BridgeError> {
        let _ = params;
        tracing::debug!(method, "ignoring notification");
        Ok(())
    }
}

pub fn parse_params<T: DeserializeOwned>(method: &str, params: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(params).map_err(|err| ProtocolError::invalid_params(method, err))
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub request_timeout: Duration,
    /// Which side this is (`agent` or `client`), attached to every log line.
    pub label: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            label: "peer".to_string(),
        }
    }
}

type Pending = HashMap<String, oneshot::Sender<Result<Value, RpcErrorObject>>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct Inner {
    writer: Mutex<Writer>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    initialized: AtomicBool,
    closed_tx: watch::Sender<bool>,
    child: Mutex<Option<Child>>,
    options: ConnectionOptions,
    started_at: Instant,
}

/// One side of a newline-delimited JSON-RPC 2.0 connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.inner.options.label)
            .field("initialized", &self.is_initialized())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Starts the read loop. `make_handler` receives a handle to the new
    /// connection so the handler can issue requests of its own.
    pub fn start<R, W, F, H>(
        reader: R,
        writer: W,
        options: ConnectionOptions,
        make_handler: F,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        F: FnOnce(Connection) -> Arc<H>,
        H: MessageHandler,
    {
        let (closed_tx, _closed_rx) = watch::channel(false);
        let connection = Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(Box::new(writer)),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                initialized: AtomicBool::new(false),
                closed_tx,
                child: Mutex::new(None),
                options,
                started_at: Instant::now(),
            }),
        };
        let handler = make_handler(connection.clone());
        connection.spawn_read_loop(reader, handler);
        connection
    }

    pub(crate) async fn attach_child(&self, child: Child) {
        *self.inner.child.lock().await = Some(child);
    }

    pub fn label(&self) -> &str {
        &self.inner.options.label
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn mark_initialized(&self) {
        if !self.inner.initialized.swap(true, Ordering::SeqCst) {
            tracing::debug!(label = %self.label(), "connection initialized");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    /// Resolves once the read half has ended.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, WireError> {
        self.request_with_timeout(method, params, self.inner.options.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, WireError> {
        if self.is_closed() {
            return Err(WireError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let id_value = json!(id);
        let key = id_key(&id_value);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(key.clone(), tx);

        // The read loop may have drained the map between the check above and the insert.
        if self.is_closed() {
            self.inner.pending.lock().await.remove(&key);
            return Err(WireError::Closed);
        }

        tracing::debug!(label = %self.label(), method, id = %key, "request → peer");
        let frame = Message::Request {
            id: id_value,
            method: method.to_string(),
            params,
        };
        if let Err(err) = self.send_frame(&frame.to_value()).await {
            self.inner.pending.lock().await.remove(&key);
            return Err(err);
        }

        let wait_start = Instant::now();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => {
                tracing::debug!(
                    label = %self.label(),
                    method,
                    id = %key,
                    response_ms = wait_start.elapsed().as_millis() as u64,
                    "response ← peer"
                );
                if method == INITIALIZE {
                    self.mark_initialized();
                }
                Ok(result)
            }
            Ok(Ok(Err(error))) => {
                tracing::debug!(
                    label = %self.label(),
                    method,
                    id = %key,
                    code = error.code,
                    "error response ← peer"
                );
                Err(WireError::Rpc(error))
            }
            Ok(Err(_)) => Err(WireError::Closed),
            Err(_) => {
                self.inner.pending.lock().await.remove(&key);
                tracing::error!(
                    label = %self.label(),
                    method,
                    id = %key,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(WireError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    pub async fn request_typed<P, R>(&self, method: &str, params: &P) -> Result<R, WireError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(WireError::Serialize)?;
        let result = self.request(method, params).await?;
        decode(method, result)
    }

    pub async fn request_typed_with_timeout<P, R>(
        &self,
        method: &str,
        params: &P,
        timeout: Duration,
    ) -> Result<R, WireError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(WireError::Serialize)?;
        let result = self.request_with_timeout(method, params, timeout).await?;
        decode(method, result)
    }

    pub async fn notify<P: Serialize + ?Sized>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<(), WireError> {
        if self.is_closed() {
            return Err(WireError::Closed);
        }
        let params = serde_json::to_value(params).map_err(WireError::Serialize)?;
        let frame = Message::Notification {
            method: method.to_string(),
            params,
        };
        self.send_frame(&frame.to_value()).await
    }

    /// Kills the child process, if this connection launched one.
    pub async fn shutdown(&self) {
        let mut child = self.inner.child.lock().await;
        if let Some(child) = child.as_mut() {
            tracing::info!(
                label = %self.label(),
                age_ms = self.inner.started_at.elapsed().as_millis() as u64,
                "shutting down peer process"
            );
            match child.try_wait() {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
        }
    }

    async fn send_frame(&self, payload: &Value) -> Result<(), WireError> {
        let bytes = serde_json::to_vec(payload).map_err(WireError::Serialize)?;
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&bytes).await.map_err(WireError::Write)?;
        writer.write_all(b"\n").await.map_err(WireError::Write)?;
        writer.flush().await.map_err(WireError::Write)?;
        Ok(())
    }

    async fn respond(&self, id: Value, outcome: Result<Value, RpcErrorObject>) {
        let frame = Message::Response { id, outcome };
        if let Err(err) = self.send_frame(&frame.to_value()).await {
            tracing::warn!(label = %self.label(), error = %err, "failed to write response");
        }
    }

    fn spawn_read_loop<R, H>(&self, reader: R, handler: Arc<H>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        H: MessageHandler,
    {
        let connection = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let mut line_count: u64 = 0;

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(label = %connection.label(), error = %err, "read failed");
                        break;
                    }
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                line_count += 1;

                let payload = match serde_json::from_str::<Value>(trimmed) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(
                            label = %connection.label(),
                            error = %err,
                            line_number = line_count,
                            "invalid JSON frame"
                        );
                        let error = RpcErrorObject::new(PARSE_ERROR, format!("parse error: {err}"));
                        connection.respond(Value::Null, Err(error)).await;
                        continue;
                    }
                };

                match Message::from_value(payload) {
                    Ok(Message::Response { id, outcome }) => {
                        connection.complete_pending(&id, outcome).await;
                    }
                    Ok(Message::Request { id, method, params }) => {
                        connection.dispatch_request(handler.clone(), id, method, params);
                    }
                    Ok(Message::Notification { method, params }) => {
                        if !connection.is_initialized() && method != INITIALIZE {
                            tracing::warn!(
                                label = %connection.label(),
                                method = %method,
                                "dropping notification received before initialize"
                            );
                            continue;
                        }
                        if let Err(err) = handler.handle_notification(&method, params).await {
                            tracing::warn!(
                                label = %connection.label(),
                                method = %method,
                                error = %err,
                                "notification handler failed"
                            );
                        }
                    }
                    Err((id, err)) => {
                        tracing::warn!(
                            label = %connection.label(),
                            error = %err,
                            line_number = line_count,
                            "malformed frame"
                        );
                        if let Some(id) = id {
                            let error = BridgeError::from(err).to_rpc_error();
                            connection.respond(id, Err(error)).await;
                        }
                    }
                }
            }

            connection.mark_closed().await;
            tracing::info!(
                label = %connection.label(),
                total_lines = line_count,
                age_ms = connection.inner.started_at.elapsed().as_millis() as u64,
                "connection closed"
            );
        });
    }

    async fn complete_pending(&self, id: &Value, outcome: Result<Value, RpcErrorObject>) {
        let key = id_key(id);
        match self.inner.pending.lock().await.remove(&key) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                tracing::warn!(
                    label = %self.label(),
                    id = %key,
                    "response has no matching pending request"
                );
            }
        }
    }

    fn dispatch_request<H: MessageHandler>(
        &self,
        handler: Arc<H>,
        id: Value,
        method: String,
        params: Value,
    ) {
        let connection = self.clone();
        tokio::spawn(async move {
            if !connection.is_initialized() && method != INITIALIZE {
                tracing::warn!(
                    label = %connection.label(),
                    method = %method,
                    "request received before initialize"
                );
                let error = BridgeError::from(ProtocolError::NotInitialized).to_rpc_error();
                connection.respond(id, Err(error)).await;
                return;
            }

            let started = Instant::now();
            let outcome = handler.handle_request(&method, params).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match outcome {
                Ok(result) => {
                    if method == INITIALIZE {
                        connection.mark_initialized();
                    }
                    tracing::debug!(
                        label = %connection.label(),
                        method = %method,
                        elapsed_ms,
                        "request handled"
                    );
                    connection.respond(id, Ok(result)).await;
                }
                Err(err) => {
                    tracing::warn!(
                        label = %connection.label(),
                        method = %method,
                        elapsed_ms,
                        error = %err,
                        "request failed"
                    );
                    connection.respond(id, Err(err.to_rpc_error())).await;
                }
            }
        });
    }

    async fn mark_closed(&self) {
        let _ = self.inner.closed_tx.send_replace(true);
        let drained: Vec<_> = self.inner.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            tracing::warn!(
                label = %self.label(),
                pending_requests = drained.len(),
                "failing pending requests on close"
            );
        }
        // Dropping the senders fails every waiter with `WireError::Closed`.
        drop(drained);
    }
}

fn decode<R: DeserializeOwned>(method: &str, result: Value) -> Result<R, WireError> {
    serde_json::from_value(result).map_err(|err| WireError::Decode {
        method: method.to_string(),
        message: err.to_string(),
    })
}
