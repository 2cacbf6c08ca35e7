//! Connection statistics.
//!
//! Lock-free counters shared by every connection of a client. Counters
//! accumulate across reconnects and restarts; read them with
//! [`ConnStats::snapshot`]. They never reset implicitly.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate counters for all connections of a client.
#[derive(Debug, Default)]
pub struct ConnStats {
    rpc_calls: AtomicU64,
    rpc_time_ms: AtomicU64,
    dial_calls: AtomicU64,
    dial_errors: AtomicU64,
    write_calls: AtomicU64,
    bytes_written: AtomicU64,
    read_calls: AtomicU64,
    bytes_read: AtomicU64,
}

impl ConnStats {
    pub(crate) fn inc_rpc_calls(&self) {
        self.rpc_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_rpc_time_ms(&self, ms: u64) {
        self.rpc_time_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub(crate) fn inc_dial_calls(&self) {
        self.dial_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_dial_errors(&self) {
        self.dial_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_write(&self, bytes: u64) {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_read(&self, bytes: u64) {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rpc_calls: self.rpc_calls.load(Ordering::Relaxed),
            rpc_time_ms: self.rpc_time_ms.load(Ordering::Relaxed),
            dial_calls: self.dial_calls.load(Ordering::Relaxed),
            dial_errors: self.dial_errors.load(Ordering::Relaxed),
            write_calls: self.write_calls.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            read_calls: self.read_calls.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ConnStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Requests handed to the wire (including fire-and-forget).
    pub rpc_calls: u64,
    /// Cumulative submit-to-response time in milliseconds.
    pub rpc_time_ms: u64,
    /// Dial attempts.
    pub dial_calls: u64,
    /// Failed dial attempts.
    pub dial_errors: u64,
    /// Buffer spills to the underlying stream.
    pub write_calls: u64,
    /// Bytes handed to the underlying stream.
    pub bytes_written: u64,
    /// Frame reads from the underlying stream.
    pub read_calls: u64,
    /// Frame bytes consumed from the underlying stream.
    pub bytes_read: u64,
}

impl StatsSnapshot {
    /// Mean RPC round-trip in milliseconds, zero when no calls completed.
    pub fn avg_rpc_time_ms(&self) -> u64 {
        if self.rpc_calls == 0 {
            0
        } else {
            self.rpc_time_ms / self.rpc_calls
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = ConnStats::default();
        stats.inc_rpc_calls();
        stats.inc_rpc_calls();
        stats.add_rpc_time_ms(30);
        stats.inc_dial_calls();
        stats.inc_dial_errors();
        stats.add_write(128);
        stats.add_read(256);

        let snap = stats.snapshot();
        assert_eq!(snap.rpc_calls, 2);
        assert_eq!(snap.rpc_time_ms, 30);
        assert_eq!(snap.dial_calls, 1);
        assert_eq!(snap.dial_errors, 1);
        assert_eq!(snap.write_calls, 1);
        assert_eq!(snap.bytes_written, 128);
        assert_eq!(snap.read_calls, 1);
        assert_eq!(snap.bytes_read, 256);
    }

    #[test]
    fn test_avg_rpc_time() {
        let stats = ConnStats::default();
        assert_eq!(stats.snapshot().avg_rpc_time_ms(), 0);

        stats.inc_rpc_calls();
        stats.inc_rpc_calls();
        stats.add_rpc_time_ms(10);
        stats.add_rpc_time_ms(20);
        assert_eq!(stats.snapshot().avg_rpc_time_ms(), 15);
    }
}
