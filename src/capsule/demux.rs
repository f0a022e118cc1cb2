//! Response demultiplexer.
//!
//! One background task per live capsule process reads decoded messages off
//! stdout and routes them: the `orla.hello` notification goes to the
//! handshake channel, responses go to the waiter registered under their id,
//! everything else is dropped.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::codec::JsonStreamDecoder;
use super::logger::CapsuleLogger;
use super::types::{HelloNotification, InboundMessage, JsonRpcResponse};

// ─── Pending Calls ───────────────────────────────────────────────────────────

/// Registry of in-flight requests, keyed by JSON-RPC id.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: RwLock<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingCalls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a waiter for `id`. The entry is removed when the returned
    /// guard is dropped, whichever way the call ends.
    pub fn register(self: &Arc<Self>, id: i64) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        self.write().insert(id, tx);
        PendingCall {
            id,
            registry: Arc::clone(self),
            response: rx,
        }
    }

    /// Remove and return the sender for `id`, if still registered.
    pub fn take(&self, id: i64) -> Option<oneshot::Sender<JsonRpcResponse>> {
        self.write().remove(&id)
    }

    pub fn remove(&self, id: i64) {
        self.write().remove(&id);
    }

    /// Drop every registered sender. Waiters observe a closed channel.
    pub fn drain(&self) -> usize {
        let mut calls = self.write();
        let count = calls.len();
        calls.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<i64, oneshot::Sender<JsonRpcResponse>>> {
        self.calls.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<i64, oneshot::Sender<JsonRpcResponse>>> {
        self.calls.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle for one registered request. Deregisters on drop.
#[derive(Debug)]
pub struct PendingCall {
    id: i64,
    registry: Arc<PendingCalls>,
    response: oneshot::Receiver<JsonRpcResponse>,
}

impl PendingCall {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Receiver for the correlated response. Errors if the entry was drained.
    pub fn response(&mut self) -> &mut oneshot::Receiver<JsonRpcResponse> {
        &mut self.response
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

// ─── Demultiplexer ───────────────────────────────────────────────────────────

/// Routes a capsule's stdout messages to their waiters.
pub struct Demultiplexer {
    tool: String,
    pending: Arc<PendingCalls>,
    handshake: mpsc::Sender<HelloNotification>,
    lifetime: CancellationToken,
    logger: Arc<dyn CapsuleLogger>,
}

impl Demultiplexer {
    pub fn new(
        tool: &str,
        pending: Arc<PendingCalls>,
        handshake: mpsc::Sender<HelloNotification>,
        lifetime: CancellationToken,
        logger: Arc<dyn CapsuleLogger>,
    ) -> Self {
        Self {
            tool: tool.to_string(),
            pending,
            handshake,
            lifetime,
            logger,
        }
    }

    /// Start the read loop on `reader`.
    ///
    /// The loop ends for good on cancellation, end of stream or the first
    /// decode error.
    pub fn spawn<R>(self, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(self.run(reader))
    }

    async fn run<R: AsyncRead + Unpin>(self, reader: R) {
        let mut decoder = JsonStreamDecoder::new(reader);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.lifetime.cancelled() => {
                    self.logger.debug("Demultiplexer stopped", &[("tool", &self.tool)]);
                    return;
                }
                next = decoder.next_value() => next,
            };

            match next {
                Ok(Some(value)) => self.route(value),
                Ok(None) => {
                    self.logger.debug("Capsule stdout closed", &[("tool", &self.tool)]);
                    return;
                }
                Err(e) => {
                    self.logger.debug(
                        "Capsule stdout decode failed",
                        &[("tool", &self.tool), ("error", &e)],
                    );
                    return;
                }
            }
        }
    }

    fn route(&self, value: serde_json::Value) {
        match InboundMessage::classify(value) {
            InboundMessage::Hello(hello) => {
                // Only the first hello is consumed; the slot holds one.
                if self.handshake.try_send(hello).is_err() {
                    self.logger
                        .debug("Ignoring repeated handshake", &[("tool", &self.tool)]);
                }
            }
            InboundMessage::Response(response) => {
                let id = response.id;
                match self.pending.take(id) {
                    Some(tx) => {
                        if tx.send(response).is_err() {
                            self.logger.debug(
                                "Response waiter already gone",
                                &[("tool", &self.tool), ("id", &id)],
                            );
                        }
                    }
                    None => self.logger.debug(
                        "Dropping response with no pending call",
                        &[("tool", &self.tool), ("id", &id)],
                    ),
                }
            }
            InboundMessage::Unrecognized(_) => {}
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::logger::recording::RecordingLogger;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    struct Harness {
        pending: Arc<PendingCalls>,
        hello_rx: mpsc::Receiver<HelloNotification>,
        lifetime: CancellationToken,
        logger: Arc<RecordingLogger>,
        stdout: DuplexStream,
        task: JoinHandle<()>,
    }

    fn harness() -> Harness {
        let (stdout, reader) = tokio::io::duplex(1024);
        let pending = PendingCalls::new();
        let (hello_tx, hello_rx) = mpsc::channel(1);
        let lifetime = CancellationToken::new();
        let logger = Arc::new(RecordingLogger::default());
        let task = Demultiplexer::new(
            "echo",
            Arc::clone(&pending),
            hello_tx,
            lifetime.clone(),
            logger.clone(),
        )
        .spawn(reader);

        Harness {
            pending,
            hello_rx,
            lifetime,
            logger,
            stdout,
            task,
        }
    }

    #[test]
    fn test_guard_deregisters_on_drop() {
        let pending = PendingCalls::new();
        let call = pending.register(5);
        assert_eq!(call.id(), 5);
        assert_eq!(pending.len(), 1);
        drop(call);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_drain_closes_waiters() {
        let pending = PendingCalls::new();
        let mut a = pending.register(1);
        let mut b = pending.register(2);

        assert_eq!(pending.drain(), 2);
        assert!(a.response().await.is_err());
        assert!(b.response().await.is_err());
    }

    #[tokio::test]
    async fn test_routes_hello_to_handshake_channel() {
        let mut h = harness();
        h.stdout
            .write_all(br#"{"jsonrpc":"2.0","method":"orla.hello","params":{"name":"echo","version":"1.0.0","capabilities":["tools"]}}"#)
            .await
            .unwrap();

        let hello = h.hello_rx.recv().await.unwrap();
        assert_eq!(hello.params.version, "1.0.0");
        assert_eq!(hello.params.capabilities, vec!["tools"]);
    }

    #[tokio::test]
    async fn test_routes_responses_by_id() {
        let mut h = harness();
        let mut first = h.pending.register(1);
        let mut second = h.pending.register(2);

        h.stdout
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":\"two\"}\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"one\"}\n")
            .await
            .unwrap();

        assert_eq!(second.response().await.unwrap().result.unwrap(), "two");
        assert_eq!(first.response().await.unwrap().result.unwrap(), "one");
        assert!(h.pending.is_empty());
    }

    #[tokio::test]
    async fn test_drops_unmatched_and_foreign_messages() {
        let mut h = harness();
        let mut call = h.pending.register(3);

        h.stdout
            .write_all(b"{\"log\":\"starting\"}\n{\"jsonrpc\":\"2.0\",\"id\":99,\"result\":1}\n{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":3}\n")
            .await
            .unwrap();

        assert_eq!(call.response().await.unwrap().id, 3);
        let dropped = h.logger.find("Dropping response with no pending call").unwrap();
        assert_eq!(dropped.fields, "tool=echo id=99");
    }

    #[tokio::test]
    async fn test_late_response_after_deregistration_is_dropped() {
        let mut h = harness();
        let call = h.pending.register(7);
        drop(call);

        h.stdout
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":7,\"result\":\"late\"}\n")
            .await
            .unwrap();
        drop(h.stdout);
        h.task.await.unwrap();

        assert!(h.logger.find("Dropping response with no pending call").is_some());
        assert!(h.hello_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exits_on_eof() {
        let h = harness();
        drop(h.stdout);
        h.task.await.unwrap();
        assert!(h.logger.find("Capsule stdout closed").is_some());
    }

    #[tokio::test]
    async fn test_exits_on_decode_error() {
        let mut h = harness();
        h.stdout.write_all(b"garbage\n").await.unwrap();
        h.task.await.unwrap();
        assert!(h.logger.find("Capsule stdout decode failed").is_some());
    }

    #[tokio::test]
    async fn test_exits_on_cancellation() {
        let h = harness();
        h.lifetime.cancel();
        h.task.await.unwrap();
        assert!(h.logger.find("Demultiplexer stopped").is_some());
    }
}
