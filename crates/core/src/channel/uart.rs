use super::{Channel, ChannelLock};
use crate::ChannelError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

bitflags::bitflags! {
    /// Transmitter status bits, laid out like a UART status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UartStatus: u32 {
        const TX_READY = 1 << 0;
        const TX_BUSY = 1 << 1;
        const TX_COMPLETE = 1 << 2;
        const LOCKED = 1 << 3;
    }
}

// Start bit, eight data bits, stop bit.
const BITS_PER_FRAME: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferState {
    Queued,
    Started,
    Cancelled,
}

/// Shared between the waiting writer and the transmitter thread. Whoever
/// moves it out of `Queued` first decides whether the bytes go out.
struct TransferSlot {
    state: Mutex<TransferState>,
}

impl TransferSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TransferState::Queued),
        })
    }

    /// Move a queued transfer to `next`. Returns the state found.
    fn claim(&self, next: TransferState) -> TransferState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let found = *state;
        if found == TransferState::Queued {
            *state = next;
        }
        found
    }
}

struct Transfer {
    bytes: Vec<u8>,
    slot: Arc<TransferSlot>,
    cancel: Receiver<()>,
    done: Sender<io::Result<()>>,
}

struct InFlight {
    len: usize,
    slot: Arc<TransferSlot>,
    cancel: Sender<()>,
    done: Receiver<io::Result<()>>,
}

/// Simulated serial transmitter.
///
/// Transfers are handed to a transmitter thread which holds each one for its
/// line time at `baud_rate`, writes it to the sink in one piece, and then
/// raises the write-complete event. A transfer whose wait times out before it
/// started is cancelled and never reaches the sink.
pub struct UartChannel {
    lock: Arc<ChannelLock>,
    holding: bool,
    status: UartStatus,
    tx: Option<Sender<Transfer>>,
    in_flight: Option<InFlight>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for UartChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UartChannel")
            .field("status", &self.status)
            .field("holding", &self.holding)
            .finish_non_exhaustive()
    }
}

impl UartChannel {
    pub fn new<W: Write + Send + 'static>(sink: W, baud_rate: Option<u32>) -> Self {
        Self::with_lock(sink, baud_rate, Arc::new(ChannelLock::new()))
    }

    /// Build a transmitter that contends for `lock` with other users of the
    /// same peripheral.
    pub fn with_lock<W: Write + Send + 'static>(
        sink: W,
        baud_rate: Option<u32>,
        lock: Arc<ChannelLock>,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Transfer>();
        let worker = thread::Builder::new()
            .name("uart-tx".to_string())
            .spawn(move || transmit_loop(sink, baud_rate, rx))
            .ok();
        if worker.is_none() {
            tracing::warn!("UART: failed to spawn transmitter thread");
        }

        Self {
            lock,
            holding: false,
            status: UartStatus::TX_READY,
            tx: worker.as_ref().map(|_| tx),
            in_flight: None,
            worker,
        }
    }

    pub fn stdout(baud_rate: Option<u32>) -> Self {
        Self::new(io::stdout(), baud_rate)
    }

    pub fn file<P: AsRef<Path>>(path: P, baud_rate: Option<u32>) -> io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::new(file, baud_rate))
    }

    pub fn lock(&self) -> Arc<ChannelLock> {
        self.lock.clone()
    }

    pub fn status(&self) -> UartStatus {
        self.status
    }
}

fn line_time(len: usize, baud_rate: Option<u32>) -> Duration {
    match baud_rate {
        Some(baud) if baud > 0 => {
            Duration::from_micros(len as u64 * BITS_PER_FRAME * 1_000_000 / baud as u64)
        }
        _ => Duration::ZERO,
    }
}

fn transmit_loop<W: Write>(mut sink: W, baud_rate: Option<u32>, rx: Receiver<Transfer>) {
    for transfer in rx {
        let pacing = line_time(transfer.bytes.len(), baud_rate);
        if !pacing.is_zero() {
            // Wakes early when the writer cancels.
            let _ = transfer.cancel.recv_timeout(pacing);
        }
        if transfer.slot.claim(TransferState::Started) == TransferState::Cancelled {
            tracing::debug!(bytes = transfer.bytes.len(), "UART: dropped cancelled transfer");
            continue;
        }
        let result = sink.write_all(&transfer.bytes).and_then(|()| sink.flush());
        let _ = transfer.done.send(result);
    }
}

impl Channel for UartChannel {
    fn acquire(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        if !self.lock.acquire(timeout) {
            return Err(ChannelError::AcquireTimeout(timeout.unwrap_or_default()));
        }
        self.holding = true;
        self.status |= UartStatus::LOCKED;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        if !self.holding {
            return Err(ChannelError::NotAcquired);
        }
        let tx = self.tx.as_ref().ok_or(ChannelError::Disconnected)?;
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(1);
        let slot = TransferSlot::new();
        tx.send(Transfer {
            bytes: bytes.to_vec(),
            slot: slot.clone(),
            cancel: cancel_rx,
            done: done_tx,
        })
        .map_err(|_| ChannelError::Disconnected)?;

        self.status.remove(UartStatus::TX_READY | UartStatus::TX_COMPLETE);
        self.status.insert(UartStatus::TX_BUSY);
        self.in_flight = Some(InFlight {
            len: bytes.len(),
            slot,
            cancel: cancel_tx,
            done: done_rx,
        });
        Ok(())
    }

    fn wait_write_complete(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        let Some(in_flight) = self.in_flight.take() else {
            return Ok(());
        };

        let result = match timeout {
            None => in_flight.done.recv().map_err(|_| ChannelError::Disconnected),
            Some(timeout) => match in_flight.done.recv_timeout(timeout) {
                Ok(result) => Ok(result),
                Err(RecvTimeoutError::Disconnected) => Err(ChannelError::Disconnected),
                Err(RecvTimeoutError::Timeout) => {
                    match in_flight.slot.claim(TransferState::Cancelled) {
                        TransferState::Queued => {
                            let _ = in_flight.cancel.send(());
                            Err(ChannelError::TransferTimeout {
                                len: in_flight.len,
                                timeout,
                            })
                        }
                        // Already on the wire; it completes without further pacing.
                        _ => in_flight.done.recv().map_err(|_| ChannelError::Disconnected),
                    }
                }
            },
        };

        match result {
            Ok(Ok(())) => {
                self.status.remove(UartStatus::TX_BUSY);
                self.status
                    .insert(UartStatus::TX_READY | UartStatus::TX_COMPLETE);
                Ok(())
            }
            Ok(Err(e)) => {
                self.status.remove(UartStatus::TX_BUSY);
                self.status.insert(UartStatus::TX_READY);
                Err(ChannelError::Io(e))
            }
            Err(e) => {
                self.status.remove(UartStatus::TX_BUSY);
                self.status.insert(UartStatus::TX_READY);
                Err(e)
            }
        }
    }

    fn release(&mut self) {
        if self.holding {
            self.holding = false;
            self.status.remove(UartStatus::LOCKED);
            self.lock.release();
        }
    }
}

impl Drop for UartChannel {
    fn drop(&mut self) {
        self.release();
        // Closing the queue lets the transmitter drain and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
