use labwired_utest_core::{Channel, ChannelError};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Forwards to `inner` and hashes every transfer that completes.
pub struct DigestChannel<C> {
    inner: C,
    staged: Vec<u8>,
    hasher: Sha256,
}

impl<C: Channel> DigestChannel<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            staged: Vec::new(),
            hasher: Sha256::new(),
        }
    }

    /// SHA-256 of the output transmitted so far, lowercase hex.
    pub fn hex_digest(&self) -> String {
        format!("{:x}", self.hasher.clone().finalize())
    }
}

impl<C: Channel> Channel for DigestChannel<C> {
    fn acquire(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        self.inner.acquire(timeout)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.inner.write(bytes)?;
        self.staged.clear();
        self.staged.extend_from_slice(bytes);
        Ok(())
    }

    fn wait_write_complete(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        let result = self.inner.wait_write_complete(timeout);
        if result.is_ok() {
            self.hasher.update(&self.staged);
        }
        self.staged.clear();
        result
    }

    fn release(&mut self) {
        self.inner.release()
    }
}
