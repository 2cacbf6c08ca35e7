//! In-flight call handles.
//!
//! A submitted call travels through the pipeline as a [`QueuedCall`]: the
//! request payload plus an optional [`Waiter`] (absent for
//! fire-and-forget). The caller keeps the matching [`AsyncResult`], which
//! resolves exactly once: with the response, a server error, or the
//! failure that tore the call down.
//!
//! Cancellation is a lock-free flag shared between the handle and the
//! waiter. The writer checks it immediately before encoding: a call
//! canceled earlier is dropped and fails with the canceled sentinel; a
//! call canceled later may still reach the server and complete normally.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::ClientError;

pub(crate) type CallOutcome<Resp> = Result<Resp, ClientError>;

/// Clonable handle for canceling a call from any task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Request cancellation. Idempotent and safe from any task.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Handle for a single in-flight call, returned by `Client::call_async`.
///
/// Resolves once the response arrives or the call fails. Dropping the
/// handle abandons the call without canceling it; use [`cancel`] for
/// that.
///
/// [`cancel`]: AsyncResult::cancel
#[derive(Debug)]
pub struct AsyncResult<Resp> {
    rx: oneshot::Receiver<CallOutcome<Resp>>,
    cancel: CancelHandle,
}

impl<Resp> AsyncResult<Resp> {
    /// Request cancellation of this call.
    ///
    /// A call canceled before it reaches the wire fails with a
    /// canceled-kind error. A call canceled after encoding may still
    /// execute server-side and deliver its normal result.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clonable cancel handle usable from other tasks.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the call to complete.
    pub async fn wait(self) -> Result<Resp, ClientError> {
        self.await
    }
}

impl<Resp> Future for AsyncResult<Resp> {
    type Output = Result<Resp, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::connection(
                "the call was dropped without a result",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Completion side of an in-flight call, held by the pipeline.
#[derive(Debug)]
pub(crate) struct Waiter<Resp> {
    reply: oneshot::Sender<CallOutcome<Resp>>,
    submitted_at: Instant,
    canceled: Arc<AtomicBool>,
}

impl<Resp> Waiter<Resp> {
    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub(crate) fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Deliver the outcome and fire the waiter. Consumes the waiter, so
    /// completion happens at most once per call.
    pub(crate) fn complete(self, outcome: CallOutcome<Resp>) {
        let _ = self.reply.send(outcome);
    }
}

/// A call as it sits in the submission queue.
#[derive(Debug)]
pub(crate) struct QueuedCall<Req, Resp> {
    pub(crate) request: Req,
    pub(crate) waiter: Option<Waiter<Resp>>,
}

impl<Req, Resp> QueuedCall<Req, Resp> {
    /// Build an entry expecting a response, paired with the caller's
    /// handle.
    pub(crate) fn with_reply(request: Req) -> (Self, AsyncResult<Resp>) {
        let (tx, rx) = oneshot::channel();
        let flag = Arc::new(AtomicBool::new(false));
        let call = Self {
            request,
            waiter: Some(Waiter {
                reply: tx,
                submitted_at: Instant::now(),
                canceled: flag.clone(),
            }),
        };
        let handle = AsyncResult {
            rx,
            cancel: CancelHandle { flag },
        };
        (call, handle)
    }

    /// Build a fire-and-forget entry: no waiter, no handle, dropped right
    /// after encoding.
    pub(crate) fn oneway(request: Req) -> Self {
        Self {
            request,
            waiter: None,
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.waiter.as_ref().is_some_and(Waiter::is_canceled)
    }

    /// Fail the entry. Fire-and-forget entries are simply dropped.
    pub(crate) fn reject(self, err: ClientError) {
        if let Some(waiter) = self.waiter {
            waiter.complete(Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_resolves_handle() {
        let (call, handle) = QueuedCall::<&str, String>::with_reply("req");

        call.waiter.unwrap().complete(Ok("resp".to_string()));
        assert_eq!(handle.wait().await.unwrap(), "resp");
    }

    #[tokio::test]
    async fn test_reject_delivers_error() {
        let (call, handle) = QueuedCall::<&str, String>::with_reply("req");
        let err = handle.wait();

        call.reject(ClientError::overflow("queue full"));
        assert!(err.await.unwrap_err().is_overflow());
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_connection_error() {
        let (call, handle) = QueuedCall::<&str, String>::with_reply("req");
        drop(call);
        assert!(handle.wait().await.unwrap_err().is_connection());
    }

    #[test]
    fn test_cancel_is_shared_and_idempotent() {
        let (call, handle) = QueuedCall::<&str, String>::with_reply("req");
        assert!(!call.is_canceled());

        let remote = handle.cancel_handle();
        remote.cancel();
        remote.cancel();
        handle.cancel();
        assert!(call.is_canceled());
    }

    #[test]
    fn test_fire_and_forget_has_no_waiter() {
        let call = QueuedCall::<&str, String>::oneway("req");
        assert!(call.waiter.is_none());
        assert!(!call.is_canceled());
        // Rejecting a fire-and-forget entry just drops it.
        call.reject(ClientError::overflow("queue full"));
    }
}
