pub mod recording;
pub mod uart;

use crate::ChannelError;
use labwired_utest_config::{ChannelConfig, ChannelKind};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

pub use recording::RecordingChannel;
pub use uart::{UartChannel, UartStatus};

/// A blocking, acquire/release guarded transport such as a serial line.
///
/// One flush maps to exactly one `acquire` / `write` / `wait_write_complete`
/// / `release` sequence. `release` is called even when `write` or the wait
/// fails.
pub trait Channel: Send {
    fn acquire(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError>;
    fn write(&mut self, bytes: &[u8]) -> Result<(), ChannelError>;
    fn wait_write_complete(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError>;
    fn release(&mut self);
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn acquire(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        (**self).acquire(timeout)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        (**self).write(bytes)
    }

    fn wait_write_complete(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        (**self).wait_write_complete(timeout)
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Discards everything. Every transfer completes immediately.
#[derive(Debug, Default)]
pub struct NullChannel {}

impl NullChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Channel for NullChannel {
    fn acquire(&mut self, _timeout: Option<Duration>) -> Result<(), ChannelError> {
        Ok(())
    }

    fn write(&mut self, _bytes: &[u8]) -> Result<(), ChannelError> {
        Ok(())
    }

    fn wait_write_complete(&mut self, _timeout: Option<Duration>) -> Result<(), ChannelError> {
        Ok(())
    }

    fn release(&mut self) {}
}

/// Binary semaphore guarding a channel, in the style of an RTOS mutex.
///
/// Shared between everything that may drive the same peripheral.
#[derive(Debug, Default)]
pub struct ChannelLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl ChannelLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock, waiting at most `timeout` (forever when `None`).
    /// Returns `false` if the wait timed out.
    pub fn acquire(&self, timeout: Option<Duration>) -> bool {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match timeout {
            None => {
                while *held {
                    held = self
                        .released
                        .wait(held)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            Some(timeout) => {
                let (guard, _) = self
                    .released
                    .wait_timeout_while(held, timeout, |held| *held)
                    .unwrap_or_else(PoisonError::into_inner);
                held = guard;
                if *held {
                    return false;
                }
            }
        }
        *held = true;
        true
    }

    pub fn release(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        *held = false;
        self.released.notify_one();
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Build the channel described by a platform profile.
pub fn from_config(config: &ChannelConfig) -> Result<Box<dyn Channel>, ChannelError> {
    let channel: Box<dyn Channel> = match config.kind {
        ChannelKind::Stdout => Box::new(UartChannel::stdout(config.baud_rate)),
        ChannelKind::File => {
            let path = config.path.as_deref().ok_or_else(|| {
                ChannelError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "file channel requires a path",
                ))
            })?;
            Box::new(UartChannel::file(path, config.baud_rate)?)
        }
        ChannelKind::Null => Box::new(NullChannel::new()),
    };
    Ok(channel)
}
