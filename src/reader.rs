//! Reader loop: correlates responses with pending waiters.
//!
//! Responses carry the message id the writer assigned. An id missing from
//! the pending table means the stream is out of sync (or the server
//! answered a fire-and-forget request); either way the framing can no
//! longer be trusted and the connection is torn down.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::watch;

use crate::codec::{Decoder, WireResponse};
use crate::conn::{ConnContext, PendingTable};
use crate::error::{ClientError, WireError, WireResult};

pub(crate) async fn read_loop<Req, Resp, R>(
    ctx: Arc<ConnContext<Req, Resp>>,
    table: Arc<PendingTable<Resp>>,
    reader: R,
    mut conn_stop: watch::Receiver<bool>,
) -> WireResult<()>
where
    Req: Serialize + Send + Sync + 'static,
    Resp: DeserializeOwned + Default + Send + 'static,
    R: AsyncRead + Unpin,
{
    let mut decoder = Decoder::new(
        reader,
        ctx.config.recv_buffer_size,
        ctx.config.compression,
        ctx.stats.clone(),
    );

    loop {
        let response: WireResponse<Resp> = tokio::select! {
            _ = conn_stop.changed() => return Ok(()),
            decoded = decoder.decode() => decoded?,
        };

        let Some(waiter) = table.remove(response.id) else {
            return Err(WireError::UnknownResponseId(response.id));
        };

        ctx.stats.inc_rpc_calls();
        ctx.stats
            .add_rpc_time_ms(waiter.submitted_at().elapsed().as_millis() as u64);

        let outcome = if response.error.is_empty() {
            Ok(response.response.unwrap_or_default())
        } else {
            Err(ClientError::server(format!(
                "server error: {}",
                response.error
            )))
        };
        waiter.complete(outcome);
    }
}
