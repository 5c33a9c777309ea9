pub mod channel;
pub mod clock;
pub mod heap;
pub mod hooks;
pub mod jump;
pub mod output;
pub mod random;
pub mod runner;

use std::time::Duration;

pub use channel::Channel;
pub use hooks::Platform;
pub use jump::{JumpStack, Outcome};
pub use labwired_utest_config::OverflowPolicy;
pub use output::{OutputAggregator, OutputStats, SharedOutput};

mod tests;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JumpError {
    #[error("Jump context stack exhausted at nesting depth {depth} (capacity {capacity})")]
    Exhausted { depth: usize, capacity: usize },
    #[error("No active jump context")]
    NoActiveContext,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Timed out acquiring the output channel after {0:?}")]
    AcquireTimeout(Duration),
    #[error("Write issued without holding the output channel")]
    NotAcquired,
    #[error("Transfer of {len} bytes did not complete within {timeout:?}")]
    TransferTimeout { len: usize, timeout: Duration },
    #[error("Output channel disconnected")]
    Disconnected,
    #[error("Channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error(transparent)]
    Jump(#[from] JumpError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("Invalid platform configuration: {0}")]
    Config(String),
}

pub type PlatformResult<T> = Result<T, PlatformError>;
