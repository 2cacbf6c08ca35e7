//! Client configuration and defaults.
//!
//! Defaults are tuned for high load; override them only with a reason.

use std::time::Duration;

/// Default capacity of the submission queue.
///
/// Should exceed the expected number of tasks calling the client
/// concurrently, otherwise overflow errors appear under load.
pub const DEFAULT_PENDING_REQUESTS: usize = 32 * 1024;

/// Default number of connections to the server.
pub const DEFAULT_CONNECTIONS: usize = 1;

/// Default per-call deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Default send/recv buffer size per connection, in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Settings captured when the client starts.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, in whatever format the dialer understands.
    pub addr: String,
    /// Concurrent connections to establish.
    pub connections: usize,
    /// Submission queue capacity.
    pub pending_requests: usize,
    /// Flush window for the writer. `None` flushes after every request
    /// (lowest latency, highest syscall cost); `Some(d)` batches requests
    /// arriving within `d` into a single flush.
    pub flush_delay: Option<Duration>,
    /// Deadline applied by `call`; `call_with_timeout` overrides it.
    pub request_timeout: Duration,
    /// Whether to request per-record compression in the handshake.
    pub compression: bool,
    /// Encoder spill threshold per connection.
    pub send_buffer_size: usize,
    /// Decoder read-buffer size per connection.
    pub recv_buffer_size: usize,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connections: DEFAULT_CONNECTIONS,
            pending_requests: DEFAULT_PENDING_REQUESTS,
            flush_delay: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            compression: true,
            send_buffer_size: DEFAULT_BUFFER_SIZE,
            recv_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Replace zero-valued knobs with their defaults. Applied once at
    /// `start`, so a partially filled config behaves.
    pub(crate) fn normalized(mut self) -> Self {
        if self.connections == 0 {
            self.connections = DEFAULT_CONNECTIONS;
        }
        if self.pending_requests == 0 {
            self.pending_requests = DEFAULT_PENDING_REQUESTS;
        }
        if self.request_timeout.is_zero() {
            self.request_timeout = DEFAULT_REQUEST_TIMEOUT;
        }
        if self.send_buffer_size == 0 {
            self.send_buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.recv_buffer_size == 0 {
            self.recv_buffer_size = DEFAULT_BUFFER_SIZE;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("127.0.0.1:9000");
        assert_eq!(config.addr, "127.0.0.1:9000");
        assert_eq!(config.connections, DEFAULT_CONNECTIONS);
        assert_eq!(config.pending_requests, DEFAULT_PENDING_REQUESTS);
        assert_eq!(config.flush_delay, None);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(config.compression);
        assert_eq!(config.send_buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.recv_buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_normalized_fills_zeroes() {
        let mut config = ClientConfig::new("addr");
        config.connections = 0;
        config.pending_requests = 0;
        config.request_timeout = Duration::ZERO;
        config.send_buffer_size = 0;
        config.recv_buffer_size = 0;

        let config = config.normalized();
        assert_eq!(config.connections, DEFAULT_CONNECTIONS);
        assert_eq!(config.pending_requests, DEFAULT_PENDING_REQUESTS);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.send_buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.recv_buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_normalized_keeps_explicit_values() {
        let mut config = ClientConfig::new("addr");
        config.connections = 4;
        config.pending_requests = 16;
        config.flush_delay = Some(Duration::from_millis(5));

        let config = config.normalized();
        assert_eq!(config.connections, 4);
        assert_eq!(config.pending_requests, 16);
        assert_eq!(config.flush_delay, Some(Duration::from_millis(5)));
    }
}
