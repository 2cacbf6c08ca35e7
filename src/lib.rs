//! # rpcmux
//!
//! Multiplexed, pipelined RPC client for request/response protocols over
//! a bidirectional byte stream.
//!
//! A single [`Client`] maintains one or more persistent connections to a
//! server and carries arbitrary serde-serializable request/response
//! values over them, correlating responses to callers by message id.
//! Many calls share each connection concurrently; there are no ordering
//! guarantees between them.
//!
//! ## Architecture
//!
//! - Callers submit into a bounded queue (non-blocking, with an
//!   overflow-substitution policy favoring the newest caller).
//! - Per connection, a writer task drains the queue, assigns message
//!   ids, and encodes length-prefixed MessagePack records; a reader task
//!   decodes responses and completes the matching waiters.
//! - A supervisor per connection dials, handshakes, and reconnects on
//!   failure, failing every affected in-flight call with a connection
//!   error.
//!
//! The transport is pluggable ([`DialFn`]); TCP is the default. A
//! one-byte handshake negotiates optional per-record compression.
//!
//! ## Example
//!
//! ```ignore
//! use rpcmux::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rpcmux::ClientError> {
//!     let mut client: Client<String, String> = Client::builder("127.0.0.1:9000")
//!         .connections(2)
//!         .build();
//!     client.start();
//!
//!     let response = client.call("ping".to_string()).await?;
//!     println!("server said: {response}");
//!
//!     client.stop().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod stats;
pub mod transport;

mod batch;
mod call;
mod client;
mod conn;
mod reader;
mod writer;

pub use batch::{Batch, BatchResult};
pub use call::{AsyncResult, CancelHandle};
pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use error::{ClientError, ErrorKind, WireError};
pub use stats::{ConnStats, StatsSnapshot};
pub use transport::{
    tcp_dial, BoxedStream, DialFn, DialFuture, OnConnectFn, OnConnectFuture, RpcStream,
};
