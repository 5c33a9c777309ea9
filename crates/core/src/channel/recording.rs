use super::Channel;
use crate::ChannelError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct TransferLog {
    transfers: Vec<Vec<u8>>,
    held: bool,
    acquisitions: usize,
    staged: Option<Vec<u8>>,
    fail_next: usize,
}

/// In-memory channel that keeps every completed transfer.
///
/// Clones share the same log, so a test can hand one clone to an aggregator
/// and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct RecordingChannel {
    log: Arc<Mutex<TransferLog>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> MutexGuard<'_, TransferLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completed transfers in the order they finished.
    pub fn transfers(&self) -> Vec<Vec<u8>> {
        self.log().transfers.clone()
    }

    /// All transmitted bytes concatenated.
    pub fn transmitted(&self) -> Vec<u8> {
        self.log().transfers.concat()
    }

    pub fn acquisitions(&self) -> usize {
        self.log().acquisitions
    }

    pub fn is_held(&self) -> bool {
        self.log().held
    }

    /// Make the next `count` transfers never report completion.
    pub fn fail_next(&self, count: usize) {
        self.log().fail_next = count;
    }
}

impl Channel for RecordingChannel {
    fn acquire(&mut self, _timeout: Option<Duration>) -> Result<(), ChannelError> {
        let mut log = self.log();
        log.held = true;
        log.acquisitions += 1;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        let mut log = self.log();
        if !log.held {
            return Err(ChannelError::NotAcquired);
        }
        log.staged = Some(bytes.to_vec());
        Ok(())
    }

    fn wait_write_complete(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        let mut log = self.log();
        let staged = log.staged.take().unwrap_or_default();
        if log.fail_next > 0 {
            log.fail_next -= 1;
            return Err(ChannelError::TransferTimeout {
                len: staged.len(),
                timeout: timeout.unwrap_or_default(),
            });
        }
        log.transfers.push(staged);
        Ok(())
    }

    fn release(&mut self) {
        self.log().held = false;
    }
}
