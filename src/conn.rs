//! Connection supervision.
//!
//! One supervisor task runs per configured connection. Each iteration
//! dials the server, performs the one-byte compression handshake, then
//! runs a writer/reader pair over the split stream until either half
//! fails or the client stops. On teardown every request still registered
//! in the pending table fails with a connection error, and the supervisor
//! re-dials after a short delay.
//!
//! The pending table is the rendezvous between the three parties: the
//! writer inserts under the connection mutex, the reader removes, the
//! supervisor drains whatever is left. Its entry count feeds the client's
//! lock-free `pending_requests_count`.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error};

use crate::call::{QueuedCall, Waiter};
use crate::codec::{HANDSHAKE_COMPRESSION_OFF, HANDSHAKE_COMPRESSION_ON};
use crate::config::ClientConfig;
use crate::error::{ClientError, WireError, WireResult};
use crate::reader::read_loop;
use crate::stats::ConnStats;
use crate::transport::{BoxedStream, DialFn, OnConnectFn};
use crate::writer::write_loop;

/// Pause before re-dialing after a failed dial.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Everything a connection supervisor needs, shared with its writer and
/// reader tasks.
pub(crate) struct ConnContext<Req, Resp> {
    pub(crate) config: ClientConfig,
    pub(crate) dial: DialFn,
    pub(crate) on_connect: Option<OnConnectFn>,
    pub(crate) queue: flume::Receiver<QueuedCall<Req, Resp>>,
    pub(crate) stats: Arc<ConnStats>,
    pub(crate) pending_count: Arc<AtomicUsize>,
    pub(crate) stop: watch::Receiver<bool>,
}

/// Per-connection map from message id to in-flight waiter.
pub(crate) struct PendingTable<Resp> {
    entries: Mutex<HashMap<u64, Waiter<Resp>>>,
    counter: Arc<AtomicUsize>,
}

impl<Resp> PendingTable<Resp> {
    pub(crate) fn new(counter: Arc<AtomicUsize>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            counter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Waiter<Resp>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next free message id and register the waiter under it.
    ///
    /// Ids are monotonic, skip `0` (reserved for fire-and-forget) and
    /// probe past any id still present. Returns the assigned id and the
    /// table size before insertion (for the runaway-server guardrail).
    pub(crate) fn register(&self, next_id: &mut u64, waiter: Waiter<Resp>) -> (u64, usize) {
        let mut entries = self.lock();
        let prior = entries.len();
        loop {
            *next_id = next_id.wrapping_add(1);
            if *next_id == 0 {
                *next_id = 1;
            }
            if !entries.contains_key(next_id) {
                break;
            }
        }
        entries.insert(*next_id, waiter);
        self.counter.fetch_add(1, Ordering::Relaxed);
        (*next_id, prior)
    }

    /// Remove and return the waiter for a response id, if registered.
    pub(crate) fn remove(&self, id: u64) -> Option<Waiter<Resp>> {
        let waiter = self.lock().remove(&id);
        if waiter.is_some() {
            self.counter.fetch_sub(1, Ordering::Relaxed);
        }
        waiter
    }

    /// Remove every waiter, leaving the table empty.
    pub(crate) fn drain(&self) -> Vec<Waiter<Resp>> {
        let drained: Vec<_> = {
            let mut entries = self.lock();
            entries.drain().map(|(_, waiter)| waiter).collect()
        };
        self.counter.fetch_sub(drained.len(), Ordering::Relaxed);
        drained
    }
}

/// Supervisor loop: dial, run the connection, reconnect, until stopped.
pub(crate) async fn run_connection<Req, Resp>(ctx: Arc<ConnContext<Req, Resp>>)
where
    Req: Serialize + Send + Sync + 'static,
    Resp: DeserializeOwned + Default + Send + 'static,
{
    let mut stop = ctx.stop.clone();
    loop {
        // Dial in a companion task so the stop signal stays responsive
        // while the dialer blocks.
        let mut dial_task = tokio::spawn((ctx.dial)(&ctx.config.addr));

        let dialed = tokio::select! {
            _ = stop.changed() => {
                // Stopping; let the dial finish quietly, its outcome no
                // longer matters.
                let _ = dial_task.await;
                return;
            }
            join = &mut dial_task => {
                ctx.stats.inc_dial_calls();
                match join {
                    Ok(result) => result,
                    Err(panic) => Err(io::Error::new(io::ErrorKind::Other, panic.to_string())),
                }
            }
        };

        match dialed {
            Ok(stream) => {
                debug!(addr = %ctx.config.addr, "connection established");
                handle_connection(&ctx, stream, &mut stop).await;
                if *stop.borrow() {
                    return;
                }
            }
            Err(err) => {
                ctx.stats.inc_dial_errors();
                error!(addr = %ctx.config.addr, error = %err, "cannot establish connection");
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
}

enum FirstDone {
    Writer(Result<WireResult<()>, JoinError>),
    Reader(Result<WireResult<()>, JoinError>),
    Stop,
}

/// Run one established connection to completion.
async fn handle_connection<Req, Resp>(
    ctx: &Arc<ConnContext<Req, Resp>>,
    mut stream: BoxedStream,
    stop: &mut watch::Receiver<bool>,
) where
    Req: Serialize + Send + Sync + 'static,
    Resp: DeserializeOwned + Default + Send + 'static,
{
    if let Some(hook) = &ctx.on_connect {
        stream = match hook(&ctx.config.addr, stream).await {
            Ok(wrapped) => wrapped,
            Err(err) => {
                error!(addr = %ctx.config.addr, error = %err, "connect hook failed");
                return;
            }
        };
    }

    let handshake = [if ctx.config.compression {
        HANDSHAKE_COMPRESSION_ON
    } else {
        HANDSHAKE_COMPRESSION_OFF
    }];
    if let Err(err) = stream.write_all(&handshake).await {
        error!(addr = %ctx.config.addr, error = %err, "cannot write handshake");
        return;
    }

    let table = Arc::new(PendingTable::new(ctx.pending_count.clone()));
    let (read_half, write_half) = tokio::io::split(stream);
    let (conn_stop_tx, conn_stop_rx) = watch::channel(false);

    let mut writer_task = tokio::spawn(write_loop(
        ctx.clone(),
        table.clone(),
        write_half,
        conn_stop_rx.clone(),
    ));
    let mut reader_task = tokio::spawn(read_loop(
        ctx.clone(),
        table.clone(),
        read_half,
        conn_stop_rx,
    ));

    let first = tokio::select! {
        join = &mut writer_task => FirstDone::Writer(join),
        join = &mut reader_task => FirstDone::Reader(join),
        _ = stop.changed() => FirstDone::Stop,
    };

    // Tell the surviving half to bail out, then join both.
    let _ = conn_stop_tx.send(true);
    let failure = match first {
        FirstDone::Writer(join) => {
            let failure = task_failure(join);
            let _ = reader_task.await;
            failure
        }
        FirstDone::Reader(join) => {
            let failure = task_failure(join);
            let _ = writer_task.await;
            failure
        }
        FirstDone::Stop => {
            let _ = writer_task.await;
            let _ = reader_task.await;
            None
        }
    };

    let error = match failure {
        Some(err) => {
            error!(addr = %ctx.config.addr, error = %err, "connection failed");
            ClientError::connection(format!(
                "connection to {} failed: {}",
                ctx.config.addr, err
            ))
        }
        None => ClientError::connection("client is stopped"),
    };

    for waiter in table.drain() {
        waiter.complete(Err(error.clone()));
    }
}

/// Collapse a joined loop result into its fatal error, if any. A panicked
/// task (a decoder bug, say) is converted instead of propagated so the
/// teardown discipline holds.
fn task_failure(join: Result<WireResult<()>, JoinError>) -> Option<WireError> {
    match join {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(panic) => Some(WireError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("connection task panicked: {panic}"),
        ))),
    }
}
