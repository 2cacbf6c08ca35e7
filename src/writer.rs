//! Writer loop: drains the submission queue onto one connection.
//!
//! The writer owns the connection's message-id counter and the encoder.
//! Requests expecting a response are registered in the pending table
//! before they touch the wire, so a response can never arrive for an id
//! the reader doesn't know. Fire-and-forget requests go out with id `0`
//! and are dropped after encoding.
//!
//! Flush scheduling: with a flush window configured, the first request
//! after a flush arms a timer and everything arriving within the window
//! shares one flush. Without a window every request is flushed
//! immediately (lower latency, more syscalls).

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::call::QueuedCall;
use crate::codec::{Encoder, WireRequest};
use crate::conn::{ConnContext, PendingTable};
use crate::error::{ClientError, WireError, WireResult};

/// A pending table this many times larger than the submission queue means
/// the server stopped responding; the connection is torn down to bound
/// client memory.
const PENDING_TABLE_FACTOR: usize = 10;

pub(crate) async fn write_loop<Req, Resp, W>(
    ctx: Arc<ConnContext<Req, Resp>>,
    table: Arc<PendingTable<Resp>>,
    writer: W,
    mut conn_stop: watch::Receiver<bool>,
) -> WireResult<()>
where
    Req: Serialize + Send + Sync + 'static,
    Resp: DeserializeOwned + Default + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let mut encoder = Encoder::new(
        writer,
        ctx.config.send_buffer_size,
        ctx.config.compression,
        ctx.stats.clone(),
    );
    let mut next_id: u64 = 0;
    let mut flush_at: Option<Instant> = None;

    loop {
        let call = match ctx.queue.try_recv() {
            Ok(call) => call,
            Err(flume::TryRecvError::Empty) => {
                // Give producers one more chance to top up the batch
                // before committing to a wait.
                tokio::task::yield_now().await;

                let deadline = flush_at.unwrap_or_else(Instant::now);
                tokio::select! {
                    _ = conn_stop.changed() => return Ok(()),
                    received = ctx.queue.recv_async() => match received {
                        Ok(call) => call,
                        // Queue dropped: the client is shutting down.
                        Err(_) => return Ok(()),
                    },
                    _ = tokio::time::sleep_until(deadline), if flush_at.is_some() => {
                        encoder.flush().await?;
                        flush_at = None;
                        continue;
                    }
                }
            }
            Err(flume::TryRecvError::Disconnected) => return Ok(()),
        };

        if let Some(window) = ctx.config.flush_delay {
            if flush_at.is_none() {
                flush_at = Some(Instant::now() + window);
            }
        }

        if call.is_canceled() {
            call.reject(ClientError::canceled());
            continue;
        }

        let QueuedCall { request, waiter } = call;
        let id = match waiter {
            // Fire-and-forget: never registered, the server must not
            // respond to id 0.
            None => 0,
            Some(waiter) => {
                let (id, prior) = table.register(&mut next_id, waiter);
                if prior > PENDING_TABLE_FACTOR * ctx.config.pending_requests {
                    return Err(WireError::TooManyPending(prior));
                }
                id
            }
        };

        encoder.encode(&WireRequest { id, request }).await?;
        if id == 0 {
            ctx.stats.inc_rpc_calls();
        }
        if ctx.config.flush_delay.is_none() {
            encoder.flush().await?;
        }
    }
}
