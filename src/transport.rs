//! Transport contract and the default TCP dialer.
//!
//! The client core is transport-agnostic: it consumes a [`DialFn`] that
//! produces a bidirectional byte stream for an address. The stream must
//! support concurrent read and write from distinct tasks (the client
//! splits it into halves); it need not tolerate concurrent reads or
//! concurrent writes.
//!
//! [`tcp_dial`] is the out-of-the-box transport. Custom transports (TLS,
//! Unix sockets, in-process pipes for tests) are a closure away:
//!
//! ```ignore
//! let dial: DialFn = Arc::new(|addr| {
//!     let addr = addr.to_string();
//!     Box::pin(async move {
//!         let stream = tokio::net::UnixStream::connect(&addr).await?;
//!         Ok(Box::new(stream) as BoxedStream)
//!     })
//! });
//! ```

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Bidirectional byte stream usable by the client core.
pub trait RpcStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RpcStream for T {}

/// Owned, type-erased stream returned by dialers and connect hooks.
pub type BoxedStream = Box<dyn RpcStream>;

/// Future resolving to a freshly dialed stream.
pub type DialFuture = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send + 'static>>;

/// Dialer invoked each time a connection (re-)establishes.
pub type DialFn = Arc<dyn Fn(&str) -> DialFuture + Send + Sync>;

/// Future resolving to the (possibly wrapped) stream from a connect hook.
pub type OnConnectFuture = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send + 'static>>;

/// Hook invoked with `(address, stream)` whenever a connection is
/// established, before the handshake byte. May wrap the stream (TLS
/// upgrade, authentication). An error closes the stream and retries the
/// dial.
pub type OnConnectFn = Arc<dyn Fn(&str, BoxedStream) -> OnConnectFuture + Send + Sync>;

/// Default transport: plain TCP with `TCP_NODELAY`.
pub fn tcp_dial() -> DialFn {
    Arc::new(|addr| {
        let addr = addr.to_string();
        Box::pin(async move {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_dial_round_trip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let dial = tcp_dial();
        let mut stream = dial(&addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_dial_refused() {
        // Port 1 is essentially never listening.
        let dial = tcp_dial();
        let result = dial("127.0.0.1:1").await;
        assert!(result.is_err());
    }
}
