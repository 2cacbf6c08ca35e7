//! Client facade and lifecycle.
//!
//! A [`Client`] multiplexes any number of concurrent calls over a small
//! set of persistent connections to one server. Build it with
//! [`Client::builder`], call [`start`](Client::start), then share it
//! freely: every operation takes `&self`.
//!
//! Submission is non-blocking. Calls enter a bounded queue drained by the
//! connection writers; when the queue is full the oldest queued entry is
//! evicted with an overflow error to make room for the newcomer, which
//! still has its whole deadline ahead of it. Fire-and-forget submissions
//! are refused outright on overflow since there is no later way to tell
//! the caller.
//!
//! # Example
//!
//! ```ignore
//! let mut client: Client<String, String> = Client::builder("127.0.0.1:9000").build();
//! client.start();
//!
//! let echoed = client.call("hello".to_string()).await?;
//! client.stop().await;
//! ```

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::batch::Batch;
use crate::call::{AsyncResult, QueuedCall};
use crate::config::ClientConfig;
use crate::conn::{run_connection, ConnContext};
use crate::error::ClientError;
use crate::stats::{ConnStats, StatsSnapshot};
use crate::transport::{tcp_dial, DialFn, OnConnectFn};

/// Fluent configuration for a [`Client`].
pub struct ClientBuilder<Req, Resp> {
    config: ClientConfig,
    dial: DialFn,
    on_connect: Option<OnConnectFn>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> ClientBuilder<Req, Resp> {
    fn new(addr: impl Into<String>) -> Self {
        Self {
            config: ClientConfig::new(addr),
            dial: tcp_dial(),
            on_connect: None,
            _marker: PhantomData,
        }
    }

    /// Number of concurrent connections to the server.
    pub fn connections(mut self, connections: usize) -> Self {
        self.config.connections = connections;
        self
    }

    /// Capacity of the submission queue.
    pub fn pending_requests(mut self, pending_requests: usize) -> Self {
        self.config.pending_requests = pending_requests;
        self
    }

    /// Flush window for request batching. `None` (the default) flushes
    /// after every request.
    pub fn flush_delay(mut self, flush_delay: Option<Duration>) -> Self {
        self.config.flush_delay = flush_delay;
        self
    }

    /// Deadline applied by [`Client::call`].
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.config.request_timeout = request_timeout;
        self
    }

    /// Whether to request per-record compression (on by default).
    pub fn compression(mut self, compression: bool) -> Self {
        self.config.compression = compression;
        self
    }

    /// Encoder spill threshold per connection, in bytes.
    pub fn send_buffer_size(mut self, send_buffer_size: usize) -> Self {
        self.config.send_buffer_size = send_buffer_size;
        self
    }

    /// Decoder read-buffer size per connection, in bytes.
    pub fn recv_buffer_size(mut self, recv_buffer_size: usize) -> Self {
        self.config.recv_buffer_size = recv_buffer_size;
        self
    }

    /// Replace the transport (TCP by default).
    pub fn dial(mut self, dial: DialFn) -> Self {
        self.dial = dial;
        self
    }

    /// Hook invoked on every established connection, before the
    /// handshake. May wrap the stream (TLS, authentication).
    pub fn on_connect(mut self, on_connect: OnConnectFn) -> Self {
        self.on_connect = Some(on_connect);
        self
    }

    /// Finish configuration. Zero-valued knobs fall back to defaults.
    pub fn build(self) -> Client<Req, Resp> {
        Client {
            config: self.config.normalized(),
            dial: self.dial,
            on_connect: self.on_connect,
            stats: Arc::new(ConnStats::default()),
            pending_count: Arc::new(AtomicUsize::new(0)),
            started: None,
        }
    }
}

struct Started<Req, Resp> {
    queue_tx: flume::Sender<QueuedCall<Req, Resp>>,
    queue_rx: flume::Receiver<QueuedCall<Req, Resp>>,
    stop_tx: watch::Sender<bool>,
    supervisors: Vec<JoinHandle<()>>,
}

/// A submission the queue refused, with the request handed back so the
/// caller can retry it.
pub(crate) struct SubmitRejected<Req> {
    pub(crate) error: ClientError,
    pub(crate) request: Req,
}

/// Multiplexed, pipelined RPC client.
///
/// `Req` and `Resp` are the caller's payload types; the client never
/// inspects them beyond handing them to the codec. `Resp::default()`
/// stands in when a successful response carries no body.
///
/// Dropping a started client tears its connections down; in-flight calls
/// fail with a connection error.
pub struct Client<Req, Resp> {
    config: ClientConfig,
    dial: DialFn,
    on_connect: Option<OnConnectFn>,
    stats: Arc<ConnStats>,
    pending_count: Arc<AtomicUsize>,
    started: Option<Started<Req, Resp>>,
}

impl<Req, Resp> Client<Req, Resp>
where
    Req: Serialize + Send + Sync + 'static,
    Resp: DeserializeOwned + Default + Send + 'static,
{
    /// Start configuring a client for the given server address.
    pub fn builder(addr: impl Into<String>) -> ClientBuilder<Req, Resp> {
        ClientBuilder::new(addr)
    }

    /// Allocate the submission queue and spawn one supervisor per
    /// connection. Must be called from within a tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if the client is already started.
    pub fn start(&mut self) {
        assert!(
            self.started.is_none(),
            "client already started; call stop() before starting again"
        );

        let (queue_tx, queue_rx) = flume::bounded(self.config.pending_requests);
        let (stop_tx, stop_rx) = watch::channel(false);
        let supervisors = (0..self.config.connections)
            .map(|_| {
                let ctx = Arc::new(ConnContext {
                    config: self.config.clone(),
                    dial: self.dial.clone(),
                    on_connect: self.on_connect.clone(),
                    queue: queue_rx.clone(),
                    stats: self.stats.clone(),
                    pending_count: self.pending_count.clone(),
                    stop: stop_rx.clone(),
                });
                tokio::spawn(run_connection(ctx))
            })
            .collect();

        self.started = Some(Started {
            queue_tx,
            queue_rx,
            stop_tx,
            supervisors,
        });
    }

    /// Tear down every connection and fail all in-flight and queued
    /// calls with a connection error. The client can be started again.
    ///
    /// # Panics
    ///
    /// Panics if the client is not started.
    pub async fn stop(&mut self) {
        let started = self
            .started
            .take()
            .expect("client is not started; call start() first");

        let _ = started.stop_tx.send(true);
        for supervisor in started.supervisors {
            let _ = supervisor.await;
        }
        // Whatever is still queued never reached a connection; fail it
        // now instead of leaving the callers waiting.
        while let Ok(call) = started.queue_rx.try_recv() {
            call.reject(ClientError::connection("client is stopped"));
        }
    }

    /// Send a request and wait for the response, bounded by the
    /// configured request timeout.
    pub async fn call(&self, request: Req) -> Result<Resp, ClientError> {
        self.call_with_timeout(request, self.config.request_timeout)
            .await
    }

    /// Send a request and wait for the response, bounded by `timeout`.
    /// On timeout the call is canceled and a timeout-kind error returned;
    /// the request may still execute server-side if it already hit the
    /// wire.
    pub async fn call_with_timeout(
        &self,
        request: Req,
        timeout: Duration,
    ) -> Result<Resp, ClientError> {
        let (call, handle) = QueuedCall::with_reply(request);
        self.enqueue(call).map_err(|rejected| rejected.error)?;

        let cancel = handle.cancel_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.cancel();
                warn!(addr = %self.config.addr, ?timeout, "call timed out");
                Err(ClientError::timeout(format!(
                    "[{}] cannot obtain response within {:?}",
                    self.config.addr, timeout
                )))
            }
        }
    }

    /// Fire-and-forget submission: never waits beyond the enqueue and
    /// guarantees nothing about delivery. Overflow is reported
    /// immediately since there is no later way to notify the caller.
    pub fn send(&self, request: Req) -> Result<(), ClientError> {
        self.enqueue(QueuedCall::oneway(request))
            .map_err(|rejected| rejected.error)
    }

    /// Submit a call and return its handle without waiting. The caller
    /// owns the handle: no timeout is applied, and cancellation is the
    /// caller's responsibility.
    pub fn call_async(&self, request: Req) -> Result<AsyncResult<Resp>, ClientError> {
        let (call, handle) = QueuedCall::with_reply(request);
        self.enqueue(call).map_err(|rejected| rejected.error)?;
        Ok(handle)
    }

    /// Create an empty batch bound to this client.
    pub fn batch(&self) -> Batch<'_, Req, Resp> {
        Batch::new(self)
    }

    /// Instantaneous number of requests awaiting submission or a
    /// response, summed over the queue and every connection. Lock-free;
    /// meant for balancing load across multiple clients.
    pub fn pending_requests_count(&self) -> usize {
        let queued = self.started.as_ref().map_or(0, |s| s.queue_tx.len());
        self.pending_count.load(Ordering::Relaxed) + queued
    }

    /// Connection statistics accumulated since the client was built.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    pub(crate) fn addr(&self) -> &str {
        &self.config.addr
    }

    /// Non-blocking enqueue with overflow substitution.
    pub(crate) fn enqueue(&self, call: QueuedCall<Req, Resp>) -> Result<(), SubmitRejected<Req>> {
        let Some(started) = self.started.as_ref() else {
            return Err(SubmitRejected {
                error: ClientError::connection("client is not started"),
                request: call.request,
            });
        };

        let call = match started.queue_tx.try_send(call) {
            Ok(()) => return Ok(()),
            Err(flume::TrySendError::Disconnected(call)) => {
                return Err(SubmitRejected {
                    error: ClientError::connection("client is stopped"),
                    request: call.request,
                });
            }
            Err(flume::TrySendError::Full(call)) => call,
        };

        if call.waiter.is_none() {
            return Err(self.rejected_overflow(call));
        }

        // Make room by failing the oldest queued entry: it is the one
        // closest to its own deadline, and without substitution a
        // sustained overload would fail every new caller.
        if let Ok(victim) = started.queue_rx.try_recv() {
            victim.reject(self.overflow_error());
        }

        match started.queue_tx.try_send(call) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(call)) => Err(self.rejected_overflow(call)),
            Err(flume::TrySendError::Disconnected(call)) => Err(SubmitRejected {
                error: ClientError::connection("client is stopped"),
                request: call.request,
            }),
        }
    }

    fn overflow_error(&self) -> ClientError {
        warn!(
            addr = %self.config.addr,
            capacity = self.config.pending_requests,
            "submission queue overflown"
        );
        ClientError::overflow(format!(
            "[{}] request queue with capacity {} is overflown; try increasing pending_requests",
            self.config.addr, self.config.pending_requests
        ))
    }

    fn rejected_overflow(&self, call: QueuedCall<Req, Resp>) -> SubmitRejected<Req> {
        SubmitRejected {
            error: self.overflow_error(),
            request: call.request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A client whose dial always fails fast: the queue is never drained,
    /// which makes the submission policy observable.
    fn undrained_client(pending: usize) -> Client<String, String> {
        Client::builder("127.0.0.1:1")
            .pending_requests(pending)
            .build()
    }

    #[tokio::test]
    async fn test_substitution_evicts_oldest() {
        let mut client = undrained_client(2);
        client.start();

        let first = client.call_async("a".to_string()).unwrap();
        let _second = client.call_async("b".to_string()).unwrap();
        // Queue full: the third call evicts the first.
        let _third = client.call_async("c".to_string()).unwrap();

        let err = first.wait().await.unwrap_err();
        assert!(err.is_overflow());
        assert_eq!(client.pending_requests_count(), 2);

        client.stop().await;
    }

    #[tokio::test]
    async fn test_send_overflow_without_substitution() {
        let mut client = undrained_client(2);
        client.start();

        client.send("a".to_string()).unwrap();
        client.send("b".to_string()).unwrap();
        // Fire-and-forget must not evict anything: both queued entries
        // are oneway and stay put.
        let err = client.send("c".to_string()).unwrap_err();
        assert!(err.is_overflow());
        assert_eq!(client.pending_requests_count(), 2);

        client.stop().await;
    }

    #[tokio::test]
    async fn test_call_evicts_oneway_victim() {
        let mut client = undrained_client(1);
        client.start();

        client.send("a".to_string()).unwrap();
        // A replied call may substitute: the oneway victim is dropped
        // silently and the call takes its slot.
        let _pending = client.call_async("b".to_string()).unwrap();
        assert_eq!(client.pending_requests_count(), 1);

        client.stop().await;
    }

    #[tokio::test]
    async fn test_stop_fails_queued_calls() {
        let mut client = undrained_client(8);
        client.start();

        let pending = client.call_async("x".to_string()).unwrap();
        client.stop().await;

        let err = pending.wait().await.unwrap_err();
        assert!(err.is_connection());
        assert_eq!(client.pending_requests_count(), 0);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let mut client = undrained_client(8);
        client.start();
        client.stop().await;
        client.start();
        client.send("y".to_string()).unwrap();
        assert_eq!(client.pending_requests_count(), 1);
        client.stop().await;
    }

    #[tokio::test]
    #[should_panic(expected = "already started")]
    async fn test_double_start_panics() {
        let mut client = undrained_client(8);
        client.start();
        client.start();
    }

    #[tokio::test]
    async fn test_not_started_is_connection_error() {
        let client = undrained_client(8);
        let err = client.send("z".to_string()).unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_dial_failures_counted() {
        let mut client = undrained_client(8);
        client.start();
        // The first dial to a refused port fails almost immediately.
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.stop().await;

        let stats = client.stats();
        assert!(stats.dial_calls >= 1);
        assert!(stats.dial_errors >= 1);
    }
}
