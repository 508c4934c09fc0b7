// Scripted peer speaking the wire format directly over an in-memory stream.

use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};

use crate::ipc::protocol::{outcome, CallbackId, Frame, RemoteError};
use crate::ipc::transport::{read_frame, write_frame};
use crate::ipc::{Arg, Connection};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct RawPeer {
    stream: DuplexStream,
    next_id: u64,
    backlog: VecDeque<Frame>,
}

impl RawPeer {
    pub(crate) fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            next_id: 1000,
            backlog: VecDeque::new(),
        }
    }

    /// Connection on one end of a duplex pipe, this peer on the other.
    pub(crate) fn connect() -> (Connection, RawPeer) {
        let (host, peer) = tokio::io::duplex(64 * 1024);
        (Connection::open(host), RawPeer::new(peer))
    }

    async fn read(&mut self) -> Frame {
        let bytes = tokio::time::timeout(RECV_TIMEOUT, read_frame(&mut self.stream))
            .await
            .expect("peer timed out waiting for a frame")
            .expect("read failed")
            .expect("host closed the stream");
        Frame::from_bytes(&bytes).expect("host sent a malformed frame")
    }

    /// Next frame, including ones set aside while waiting for a reply.
    pub(crate) async fn recv(&mut self) -> Frame {
        match self.backlog.pop_front() {
            Some(frame) => frame,
            None => self.read().await,
        }
    }

    pub(crate) async fn send(&mut self, frame: &Frame) {
        let bytes = frame.to_bytes().expect("encode frame");
        write_frame(&mut self.stream, &bytes)
            .await
            .expect("write frame");
    }

    pub(crate) async fn send_raw(&mut self, payload: &[u8]) {
        write_frame(&mut self.stream, payload)
            .await
            .expect("write raw frame");
    }

    /// Invoke a host callback and wait for the matching reply; other frames are queued.
    pub(crate) async fn invoke(
        &mut self,
        callback: &CallbackId,
        args: Value,
    ) -> Result<Value, RemoteError> {
        self.next_id += 1;
        let id = self.next_id;
        self.send(&Frame::CallbackInvoke {
            id,
            callback: callback.clone(),
            args,
        })
        .await;

        loop {
            match self.read().await {
                Frame::CallbackReply {
                    id: reply_id,
                    data,
                    error,
                } if reply_id == id => return outcome(data, error),
                other => self.backlog.push_back(other),
            }
        }
    }

    /// Wait for the host to invoke one of our callbacks; answer it with `reply`.
    pub(crate) async fn expect_invoke(&mut self, reply: Value) -> (CallbackId, Value) {
        let position = self
            .backlog
            .iter()
            .position(|frame| matches!(frame, Frame::CallbackInvoke { .. }));
        let frame = match position.and_then(|index| self.backlog.remove(index)) {
            Some(frame) => frame,
            None => loop {
                match self.read().await {
                    frame @ Frame::CallbackInvoke { .. } => break frame,
                    other => self.backlog.push_back(other),
                }
            },
        };

        let Frame::CallbackInvoke { id, callback, args } = frame else {
            unreachable!("filtered above");
        };
        self.send(&Frame::reply(id, Ok(reply))).await;
        (callback, args)
    }

    /// True when nothing else arrives within `wait`.
    pub(crate) async fn is_quiet(&mut self, wait: Duration) -> bool {
        if !self.backlog.is_empty() {
            return false;
        }
        match tokio::time::timeout(wait, read_frame(&mut self.stream)).await {
            Err(_) => true,
            Ok(Ok(Some(bytes))) => {
                if let Ok(frame) = Frame::from_bytes(&bytes) {
                    self.backlog.push_back(frame);
                }
                false
            }
            Ok(_) => true,
        }
    }

    pub(crate) async fn shutdown(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Register every callback in `arg` on `connection`; returns the tree the peer would receive.
pub(crate) fn register_all(connection: &Connection, arg: Arg) -> Value {
    match arg {
        Arg::Value(value) => value,
        Arg::Callback(callback) => connection.register_callback(callback).placeholder(),
        Arg::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, arg)| (key, register_all(connection, arg)))
                .collect(),
        ),
        Arg::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|arg| register_all(connection, arg))
                .collect(),
        ),
    }
}

/// Callback id found at `name` in a registered tree.
pub(crate) fn callback_at(tree: &Value, name: &str) -> CallbackId {
    CallbackId::from_placeholder(&tree[name]).expect("no callback under that name")
}
