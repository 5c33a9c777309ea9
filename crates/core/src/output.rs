use crate::channel::Channel;
use crate::ChannelError;
use labwired_utest_config::OverflowPolicy;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutputStats {
    /// Completed transfers, including zero-length ones.
    pub transfers: u64,
    /// Bytes the channel acknowledged.
    pub transmitted: u64,
    /// Bytes discarded by an overflow restart.
    pub dropped: u64,
    /// Bytes discarded because their flush failed.
    pub lost: u64,
    pub failed_flushes: u64,
}

/// Collects single-byte writes and sends them over `C` in one transfer per
/// flush.
///
/// The last slot of the buffer is never filled, so at most `capacity - 1`
/// bytes are pending at any time.
#[derive(Debug)]
pub struct OutputAggregator<C: Channel> {
    buffer: Box<[u8]>,
    cursor: usize,
    policy: OverflowPolicy,
    flush_timeout: Option<Duration>,
    channel: C,
    stats: OutputStats,
}

impl<C: Channel> OutputAggregator<C> {
    /// # Panics
    ///
    /// Panics if `capacity` is smaller than 2.
    pub fn new(channel: C, capacity: usize) -> Self {
        assert!(capacity >= 2, "output buffer needs at least 2 bytes");
        Self {
            buffer: vec![0; capacity].into_boxed_slice(),
            cursor: 0,
            policy: OverflowPolicy::Restart,
            flush_timeout: None,
            channel,
            stats: OutputStats::default(),
        }
    }

    pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bound every acquire and completion wait. `None` waits forever.
    pub fn with_flush_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn pending(&self) -> &[u8] {
        &self.buffer[..self.cursor]
    }

    pub fn stats(&self) -> OutputStats {
        self.stats
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Append one byte and return it.
    ///
    /// With [`OverflowPolicy::Restart`] a write that finds only the reserved
    /// slot left discards everything pending first. This never blocks.
    pub fn write_char(&mut self, byte: u8) -> u8 {
        if self.cursor == self.capacity() - 1 {
            match self.policy {
                OverflowPolicy::Restart => {
                    tracing::warn!(
                        dropped = self.cursor,
                        "output buffer full, discarding pending bytes"
                    );
                    self.stats.dropped += self.cursor as u64;
                    self.clear();
                }
                OverflowPolicy::FlushOnFull => {
                    // A failed flush already accounted for the bytes and cleared the buffer.
                    let _ = self.flush();
                }
            }
        }

        self.buffer[self.cursor] = byte;
        self.cursor += 1;
        byte
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.write_char(byte);
        }
    }

    /// Transmit everything pending as one transfer, then clear the buffer.
    ///
    /// An empty buffer still produces a zero-length transfer. Returns the
    /// number of bytes sent.
    ///
    /// # Errors
    ///
    /// Returns the channel error when acquisition or the transfer fails. The
    /// pending bytes are discarded either way.
    pub fn flush(&mut self) -> Result<usize, ChannelError> {
        let len = self.cursor;
        let result = self.transmit(len);
        self.clear();

        match result {
            Ok(()) => {
                self.stats.transfers += 1;
                self.stats.transmitted += len as u64;
                tracing::debug!(bytes = len, "flushed output buffer");
                Ok(len)
            }
            Err(e) => {
                self.stats.lost += len as u64;
                self.stats.failed_flushes += 1;
                tracing::warn!(bytes = len, error = %e, "output flush failed, bytes lost");
                Err(e)
            }
        }
    }

    /// Drop pending bytes without transmitting them.
    pub fn reset(&mut self) {
        self.clear();
    }

    fn transmit(&mut self, len: usize) -> Result<(), ChannelError> {
        self.channel.acquire(self.flush_timeout)?;
        let mut result = self.channel.write(&self.buffer[..len]);
        if result.is_ok() {
            result = self.channel.wait_write_complete(self.flush_timeout);
        }
        self.channel.release();
        result
    }

    fn clear(&mut self) {
        self.buffer.fill(0);
        self.cursor = 0;
    }
}

impl<C: Channel> std::fmt::Write for OutputAggregator<C> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Aggregator shared between execution contexts.
///
/// Every call holds the lock for its whole duration, so a `write_line` can
/// never interleave with another writer's bytes.
#[derive(Debug)]
pub struct SharedOutput<C: Channel> {
    inner: Arc<Mutex<OutputAggregator<C>>>,
}

impl<C: Channel> Clone for SharedOutput<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Channel> SharedOutput<C> {
    pub fn new(aggregator: OutputAggregator<C>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(aggregator)),
        }
    }

    // A writer that escaped while holding the lock leaves valid state behind.
    fn lock(&self) -> MutexGuard<'_, OutputAggregator<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write_char(&self, byte: u8) -> u8 {
        self.lock().write_char(byte)
    }

    pub fn write_str(&self, s: &str) {
        self.lock().write_bytes(s.as_bytes());
    }

    pub fn flush(&self) -> Result<usize, ChannelError> {
        self.lock().flush()
    }

    /// Write `line` and a newline, then flush, all under one lock.
    pub fn write_line(&self, line: &str) -> Result<usize, ChannelError> {
        let mut out = self.lock();
        out.write_bytes(line.as_bytes());
        out.write_char(b'\n');
        out.flush()
    }

    pub fn stats(&self) -> OutputStats {
        self.lock().stats()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut OutputAggregator<C>) -> R) -> R {
        f(&mut self.lock())
    }
}
