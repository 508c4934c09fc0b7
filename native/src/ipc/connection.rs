//! Protocol core: correlates requests, responses and callback traffic over one stream.
//!
//! Two background tasks serve a connection. The writer drains an outbound queue onto the
//! stream. The dispatch loop reads frames one at a time and routes them: responses and replies
//! resolve pending entries by id, callback invocations are looked up in the registry and their
//! handlers called right there, in frame order. Only awaiting the handler's future and sending the
//! reply move to a task of their own, so a slow handler never stalls the next frame.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};

use super::callbacks::{Callback, CallbackRegistry};
use super::params::Arg;
use super::protocol::{outcome, CallbackId, Frame, ProtocolError, RemoteError};
use super::transport::{read_frame, write_frame, TransportError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("{method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("installer process terminated: {0}")]
    ProcessTerminated(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("remote error: {0}")]
    Remote(RemoteError),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl RpcError {
    /// Whether the connection is gone after this error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(_) | RpcError::ProcessTerminated(_) | RpcError::ConnectionClosed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Request,
    Invoke,
}

impl PendingKind {
    fn frame_kind(self) -> &'static str {
        match self {
            PendingKind::Request => "response",
            PendingKind::Invoke => "callback_reply",
        }
    }
}

/// Outstanding call as seen from diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub id: u64,
    pub method: String,
    pub created_at: DateTime<Utc>,
}

struct Pending {
    kind: PendingKind,
    label: String,
    created_at: DateTime<Utc>,
    tx: oneshot::Sender<Result<Value, RpcError>>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, Pending>,
    // Requests whose caller gave up; their callbacks stay registered until released.
    timed_out: HashSet<u64>,
    closed: Option<RpcError>,
}

struct Shared {
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
    callbacks: CallbackRegistry,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn close_reason(&self) -> Option<RpcError> {
        self.pending().closed.clone()
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), RpcError> {
        if let Some(reason) = self.close_reason() {
            return Err(reason);
        }
        let payload = frame
            .to_bytes()
            .map_err(|e| RpcError::Encode(e.to_string()))?;
        self.outbound
            .send(payload)
            .map_err(|_| RpcError::ConnectionClosed)
    }

    fn dispatch(self: &Arc<Self>, bytes: &[u8]) {
        let frame = match Frame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[IPC] Dropping frame: {}", e);
                return;
            }
        };

        match frame {
            Frame::Response { id, data, error } => {
                self.resolve(id, PendingKind::Request, outcome(data, error))
            }
            Frame::CallbackReply { id, data, error } => {
                self.resolve(id, PendingKind::Invoke, outcome(data, error))
            }
            Frame::CallbackInvoke { id, callback, args } => self.invoke_local(id, callback, args),
            Frame::Request { id, method, .. } => {
                let err = ProtocolError::UnsupportedMethod(method);
                warn!("[IPC] Protocol error: {}", err);
                if let Err(e) = self.send_frame(&Frame::response(id, Err(err.to_remote()))) {
                    debug!("[IPC] Could not refuse request {}: {}", id, e);
                }
            }
        }
    }

    fn resolve(&self, id: u64, kind: PendingKind, result: Result<Value, RemoteError>) {
        let entry = {
            let mut table = self.pending();
            match table.entries.get(&id) {
                Some(pending) if pending.kind == kind => table.entries.remove(&id),
                Some(_) => {
                    warn!(
                        "[IPC] Protocol error: {}",
                        ProtocolError::MismatchedReply {
                            id,
                            kind: kind.frame_kind()
                        }
                    );
                    None
                }
                None if table.timed_out.contains(&id) => {
                    debug!("[IPC] Late {} for timed out call {}", kind.frame_kind(), id);
                    None
                }
                None => {
                    warn!(
                        "[IPC] Protocol error: {}",
                        ProtocolError::UnknownCorrelation(id)
                    );
                    None
                }
            }
        };

        let Some(pending) = entry else {
            return;
        };

        debug!(
            "[IPC] {} #{} settled after {} ms",
            pending.label,
            id,
            (Utc::now() - pending.created_at).num_milliseconds()
        );
        if kind == PendingKind::Request {
            self.callbacks.release_owner(id);
        }
        let _ = pending.tx.send(result.map_err(RpcError::Remote));
    }

    fn invoke_local(self: &Arc<Self>, id: u64, callback: CallbackId, args: Value) {
        match self.callbacks.take_for_invoke(&callback) {
            Ok(handler) => {
                debug!("[IPC] Invoking callback {} (call {})", callback, id);
                let shared = Arc::downgrade(self);
                let reply = handler(args);
                tokio::spawn(async move {
                    let result = reply.await;
                    if let Some(shared) = shared.upgrade() {
                        if let Err(e) = shared.send_frame(&Frame::reply(id, result)) {
                            debug!("[IPC] Reply to callback {} dropped: {}", callback, e);
                        }
                    }
                });
            }
            Err(e) => {
                warn!("[IPC] Protocol error: {}", e);
                if let Err(send_err) = self.send_frame(&Frame::reply(id, Err(e.to_remote()))) {
                    debug!("[IPC] Could not report unknown callback: {}", send_err);
                }
            }
        }
    }

    /// Terminal failure: every waiter is resolved exactly once with `reason`.
    fn fail_all(&self, reason: RpcError) {
        let drained: Vec<Pending> = {
            let mut table = self.pending();
            if table.closed.is_some() {
                return;
            }
            table.closed = Some(reason.clone());
            table.timed_out.clear();
            table.entries.drain().map(|(_, pending)| pending).collect()
        };

        let released = self.callbacks.clear();
        self.closed_tx.send_replace(true);

        info!(
            "[IPC] Connection closed ({}): {} pending calls failed, {} callbacks released",
            reason,
            drained.len(),
            released
        );

        for pending in drained {
            let _ = pending.tx.send(Err(reason.clone()));
        }
    }
}

// Forgets a call whose caller stopped waiting before it settled.
struct CallGuard<'a> {
    shared: &'a Shared,
    id: u64,
    kind: PendingKind,
    armed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.shared.pending().entries.remove(&self.id).is_some() {
            debug!("[IPC] Call {} abandoned by its caller", self.id);
        }
        if self.kind == PendingKind::Request {
            self.shared.callbacks.release_owner(self.id);
        }
    }
}

/// One live protocol session over a single transport stream.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Take ownership of `stream` and start the writer and dispatch tasks.
    pub fn open<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(PendingTable::default()),
            callbacks: CallbackRegistry::new(),
            outbound: outbound_tx,
            closed_tx,
        });

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            Arc::downgrade(&shared),
            closed_rx.clone(),
        ));
        tokio::spawn(read_loop(reader, Arc::downgrade(&shared), closed_rx));

        Self { shared }
    }

    /// Send `method` and wait for its response.
    ///
    /// Callbacks inside `params` are registered before the frame is queued. They are released
    /// when the response arrives; on timeout they stay registered until
    /// [`Connection::release_timed_out_callbacks`] or the connection closes.
    pub async fn request(
        &self,
        method: &str,
        params: impl Into<Arg>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if let Some(reason) = self.shared.close_reason() {
            return Err(reason);
        }

        let id = self.shared.next_id();
        let params = params.into().encode(&self.shared.callbacks, Some(id));
        let frame = Frame::Request {
            id,
            method: method.to_string(),
            params,
        };

        let result = self
            .call(id, PendingKind::Request, method.to_string(), &frame, timeout)
            .await;

        if let Err(e) = &result {
            if !matches!(e, RpcError::Timeout { .. }) {
                self.shared.callbacks.release_owner(id);
            }
        }
        result
    }

    /// Invoke a callback the peer handed us and wait for its reply.
    pub async fn invoke_remote(
        &self,
        callback: &CallbackId,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let id = self.shared.next_id();
        let frame = Frame::CallbackInvoke {
            id,
            callback: callback.clone(),
            args,
        };
        self.call(
            id,
            PendingKind::Invoke,
            format!("callback {}", callback),
            &frame,
            timeout,
        )
        .await
    }

    async fn call(
        &self,
        id: u64,
        kind: PendingKind,
        label: String,
        frame: &Frame,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let payload = frame
            .to_bytes()
            .map_err(|e| RpcError::Encode(e.to_string()))?;
        let (tx, rx) = oneshot::channel();

        {
            let mut table = self.shared.pending();
            if let Some(reason) = &table.closed {
                return Err(reason.clone());
            }
            table.entries.insert(
                id,
                Pending {
                    kind,
                    label: label.clone(),
                    created_at: Utc::now(),
                    tx,
                },
            );
        }
        let mut guard = CallGuard {
            shared: &self.shared,
            id,
            kind,
            armed: true,
        };

        if self.shared.outbound.send(payload).is_err() {
            return Err(RpcError::ConnectionClosed);
        }

        let mut rx = rx;
        let settled = tokio::time::timeout(timeout, &mut rx).await;
        guard.armed = false;

        match settled {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self
                .shared
                .close_reason()
                .unwrap_or(RpcError::ConnectionClosed)),
            Err(_) => {
                let expired = {
                    let mut table = self.shared.pending();
                    let removed = table.entries.remove(&id).is_some();
                    if removed && kind == PendingKind::Request {
                        table.timed_out.insert(id);
                    }
                    removed
                };
                if !expired {
                    // Settled between the deadline and the lock.
                    return match rx.await {
                        Ok(result) => result,
                        Err(_) => Err(self
                            .shared
                            .close_reason()
                            .unwrap_or(RpcError::ConnectionClosed)),
                    };
                }
                warn!("[IPC] {} #{} timed out after {:?}", label, id, timeout);
                Err(RpcError::Timeout {
                    method: label,
                    timeout,
                })
            }
        }
    }

    /// Register a handler not tied to any request.
    pub fn register_callback(&self, callback: Callback) -> CallbackId {
        self.shared.callbacks.register(None, callback)
    }

    pub fn release_callback(&self, id: &CallbackId) -> bool {
        self.shared.callbacks.release(id)
    }

    /// Free the callbacks of requests that timed out.
    pub fn release_timed_out_callbacks(&self) -> usize {
        let owners: Vec<u64> = self.shared.pending().timed_out.drain().collect();
        owners
            .into_iter()
            .map(|owner| self.shared.callbacks.release_owner(owner))
            .sum()
    }

    /// Fail every pending call with `reason` and stop both tasks.
    pub fn terminate(&self, reason: RpcError) {
        self.shared.fail_all(reason);
    }

    pub fn close(&self) {
        self.terminate(RpcError::ConnectionClosed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.close_reason().is_some()
    }

    pub fn close_reason(&self) -> Option<RpcError> {
        self.shared.close_reason()
    }

    /// Wait until the connection reaches its terminal state.
    pub async fn closed(&self) -> RpcError {
        let mut closed = self.shared.closed_tx.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
        self.close_reason().unwrap_or(RpcError::ConnectionClosed)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending().entries.len()
    }

    pub fn pending_requests(&self) -> Vec<RequestInfo> {
        let table = self.shared.pending();
        let mut requests: Vec<RequestInfo> = table
            .entries
            .iter()
            .filter(|(_, pending)| pending.kind == PendingKind::Request)
            .map(|(id, pending)| RequestInfo {
                id: *id,
                method: pending.label.clone(),
                created_at: pending.created_at,
            })
            .collect();
        requests.sort_by_key(|request| request.id);
        requests
    }

    pub fn callback_count(&self) -> usize {
        self.shared.callbacks.len()
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// Non-owning handle for handlers that live inside the connection's own registry.
#[derive(Clone)]
pub struct WeakConnection {
    shared: Weak<Shared>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.shared.upgrade().map(|shared| Connection { shared })
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Weak<Shared>,
    mut closed: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(payload) = next else {
                    break;
                };
                if let Err(e) = write_frame(&mut writer, &payload).await {
                    error!("[IPC] Write error: {}", e);
                    if let Some(shared) = shared.upgrade() {
                        shared.fail_all(RpcError::Transport(e));
                    }
                    break;
                }
            }
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(mut reader: R, shared: Weak<Shared>, mut closed: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let next = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => return,
        };

        match next {
            Ok(Some(bytes)) => match shared.upgrade() {
                Some(shared) => shared.dispatch(&bytes),
                None => return,
            },
            Ok(None) => break RpcError::ConnectionClosed,
            Err(e) => {
                error!("[IPC] Read error: {}", e);
                break RpcError::Transport(e);
            }
        }
    };

    if let Some(shared) = shared.upgrade() {
        shared.fail_all(reason);
    }
}
