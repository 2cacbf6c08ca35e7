//! Grouped submission with a shared deadline.
//!
//! A [`Batch`] accumulates requests and submits them all at once when
//! [`call`](Batch::call) runs. The server executes batched requests in
//! unspecified order; the batch provides grouping and one deadline
//! covering every entry. Each `add` hands back a [`BatchResult`] that is
//! guaranteed to resolve before the batch call returns.
//!
//! Submission retries a handful of times on queue overflow, spaced a few
//! milliseconds apart, before giving up on the whole batch.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

use crate::call::{AsyncResult, QueuedCall};
use crate::client::Client;
use crate::error::ClientError;

/// Enqueue attempts per entry before the batch gives up on overflow.
const SUBMIT_ATTEMPTS: usize = 6;

/// Pause between enqueue attempts.
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// An accumulating group of requests sharing one deadline.
///
/// Create with [`Client::batch`]. Adding entries is safe from concurrent
/// tasks; `call` snapshots and clears the accumulated entries, so the
/// batch can be reused afterwards.
pub struct Batch<'a, Req, Resp> {
    client: &'a Client<Req, Resp>,
    entries: Mutex<Vec<BatchEntry<Req, Resp>>>,
}

struct BatchEntry<Req, Resp> {
    request: Req,
    reply: Option<oneshot::Sender<Result<Resp, ClientError>>>,
}

/// Per-entry result of a batch call. Resolves once the batch call
/// returns.
#[derive(Debug)]
pub struct BatchResult<Resp> {
    rx: oneshot::Receiver<Result<Resp, ClientError>>,
}

impl<Resp> BatchResult<Resp> {
    /// Wait for this entry's outcome.
    pub async fn wait(self) -> Result<Resp, ClientError> {
        self.await
    }
}

impl<Resp> Future for BatchResult<Resp> {
    type Output = Result<Resp, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::connection(
                "the batch was dropped without a result",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<'a, Req, Resp> Batch<'a, Req, Resp>
where
    Req: Serialize + Send + Sync + 'static,
    Resp: DeserializeOwned + Default + Send + 'static,
{
    pub(crate) fn new(client: &'a Client<Req, Resp>) -> Self {
        Self {
            client,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Add a request to the batch.
    pub fn add(&self, request: Req) -> BatchResult<Resp> {
        let (tx, rx) = oneshot::channel();
        self.lock().push(BatchEntry {
            request,
            reply: Some(tx),
        });
        BatchResult { rx }
    }

    /// Add a fire-and-forget request to the batch; any response is
    /// ignored.
    pub fn add_oneway(&self, request: Req) {
        self.lock().push(BatchEntry {
            request,
            reply: None,
        });
    }

    /// Number of entries accumulated so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Submit every accumulated entry and wait for all results, bounded
    /// by the client's request timeout.
    pub async fn call(&self) -> Result<(), ClientError> {
        self.call_with_timeout(self.client.request_timeout()).await
    }

    /// Submit every accumulated entry and wait for all results, bounded
    /// by `timeout`.
    ///
    /// Every [`BatchResult`] handed out for these entries resolves before
    /// this returns: with its response, with the per-entry error (an
    /// evicted entry sees overflow, a late one timeout), or with the
    /// batch-level failure.
    pub async fn call_with_timeout(&self, timeout: Duration) -> Result<(), ClientError> {
        let entries = std::mem::take(&mut *self.lock());

        let mut waits = Vec::with_capacity(entries.len());
        let mut entries = entries.into_iter();
        while let Some(entry) = entries.next() {
            let oneway = entry.reply.is_none();
            match submit_with_retry(self.client, entry.request, oneway).await {
                Ok(Some(handle)) => {
                    if let Some(reply) = entry.reply {
                        waits.push((handle, reply));
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    // Resolve everything so no BatchResult is left
                    // dangling, then report the batch as failed.
                    if let Some(reply) = entry.reply {
                        let _ = reply.send(Err(error.clone()));
                    }
                    for entry in entries {
                        if let Some(reply) = entry.reply {
                            let _ = reply.send(Err(error.clone()));
                        }
                    }
                    for (handle, reply) in waits {
                        handle.cancel();
                        let _ = reply.send(Err(error.clone()));
                    }
                    return Err(error);
                }
            }
        }

        let deadline = Instant::now() + timeout;
        let mut waits = waits.into_iter();
        while let Some((mut handle, reply)) = waits.next() {
            tokio::select! {
                outcome = &mut handle => {
                    let _ = reply.send(outcome);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(addr = %self.client.addr(), ?timeout, "batch call timed out");
                    let error = ClientError::timeout(format!(
                        "[{}] batch cannot obtain responses within {:?}",
                        self.client.addr(),
                        timeout
                    ));
                    handle.cancel();
                    let _ = reply.send(Err(error.clone()));
                    for (handle, reply) in waits {
                        handle.cancel();
                        let _ = reply.send(Err(error.clone()));
                    }
                    return Err(error);
                }
            }
        }

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<BatchEntry<Req, Resp>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Enqueue with a bounded retry loop; only overflow is retried.
async fn submit_with_retry<Req, Resp>(
    client: &Client<Req, Resp>,
    request: Req,
    oneway: bool,
) -> Result<Option<AsyncResult<Resp>>, ClientError>
where
    Req: Serialize + Send + Sync + 'static,
    Resp: DeserializeOwned + Default + Send + 'static,
{
    let mut request = request;
    let mut attempts = SUBMIT_ATTEMPTS;
    loop {
        let (call, handle) = if oneway {
            (QueuedCall::oneway(request), None)
        } else {
            let (call, handle) = QueuedCall::with_reply(request);
            (call, Some(handle))
        };

        match client.enqueue(call) {
            Ok(()) => return Ok(handle),
            Err(rejected) => {
                attempts -= 1;
                if attempts == 0 || !rejected.error.is_overflow() {
                    return Err(rejected.error);
                }
                request = rejected.request;
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_accumulates_and_clears() {
        let client: Client<String, String> = Client::builder("127.0.0.1:1").build();
        let batch = client.batch();

        let _first = batch.add("a".to_string());
        batch.add_oneway("b".to_string());
        assert_eq!(batch.len(), 2);

        // Not started: the batch call fails, but the entry list is
        // consumed either way.
        assert!(batch.call_with_timeout(Duration::from_millis(50)).await.is_err());
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_batch_failure_resolves_every_result() {
        let client: Client<String, String> = Client::builder("127.0.0.1:1").build();
        let batch = client.batch();

        let first = batch.add("a".to_string());
        let second = batch.add("b".to_string());

        let err = batch
            .call_with_timeout(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_connection());

        assert!(first.wait().await.unwrap_err().is_connection());
        assert!(second.wait().await.unwrap_err().is_connection());
    }

    #[tokio::test]
    async fn test_batch_overflow_retry_exhausts() {
        // Queue of one, never drained: two batch entries cannot both fit,
        // and the second entry's retries keep evicting the first.
        let mut client: Client<String, String> = Client::builder("127.0.0.1:1")
            .pending_requests(1)
            .build();
        client.start();

        let batch = client.batch();
        batch.add_oneway("a".to_string());
        batch.add_oneway("b".to_string());

        let err = batch
            .call_with_timeout(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_overflow());

        client.stop().await;
    }
}
