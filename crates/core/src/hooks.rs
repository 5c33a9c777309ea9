//! The complete hook set a unit-test harness links against on the target.
//!
//! Most hooks forward to a collaborator chosen at startup ([`Heap`],
//! [`Clock`], [`RandomSource`], the output [`Channel`]). The process and file
//! hooks exist so the harness links; they report that the feature is missing.

use crate::channel::{self, Channel};
use crate::clock::{self, Clock};
use crate::heap::{Heap, HeapStats, SystemHeap};
use crate::jump::{JumpStack, Outcome};
use crate::output::{OutputAggregator, OutputStats, SharedOutput};
use crate::random::{self, RandomSource};
use crate::{JumpError, PlatformError, PlatformResult};
use labwired_utest_config::PlatformConfig;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::ptr::NonNull;

pub const FORK_UNSUPPORTED: &str = "-p doesn't work on this platform, as it is lacking fork.";

/// Report style the harness should use for failure locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingEnvironment {
    Eclipse,
}

/// Opaque stand-in for a file handle. Never produced on this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformFile(u32);

/// Handle returned by the dummy mutex hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformMutex(u32);

pub struct Platform<C: Channel> {
    jump: JumpStack,
    output: SharedOutput<C>,
    heap: Box<dyn Heap>,
    clock: Box<dyn Clock>,
    rng: RefCell<Box<dyn RandomSource>>,
    at_exit: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl<C: Channel> std::fmt::Debug for Platform<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("jump", &self.jump)
            .field("heap", &self.heap.stats())
            .finish_non_exhaustive()
    }
}

impl Platform<Box<dyn Channel>> {
    /// Wire every hook up as described by a validated profile.
    pub fn from_config(config: &PlatformConfig) -> PlatformResult<Self> {
        let channel = channel::from_config(&config.channel)?;
        Platform::with_config(config, channel)
    }
}

impl<C: Channel> Platform<C> {
    /// Like [`Platform::from_config`] but sends output over `channel`
    /// instead of the configured one.
    pub fn with_config(config: &PlatformConfig, channel: C) -> PlatformResult<Self> {
        let capacity = config
            .output
            .capacity()
            .map_err(|e| PlatformError::Config(format!("{e:#}")))?;
        if capacity < 2 {
            return Err(PlatformError::Config(format!(
                "output buffer of {capacity} bytes is too small"
            )));
        }
        if config.jump_stack.capacity == 0 {
            return Err(PlatformError::Config(
                "jump stack capacity must be at least 1".to_string(),
            ));
        }

        let output = OutputAggregator::new(channel, capacity)
            .with_policy(config.output.overflow)
            .with_flush_timeout(config.output.flush_timeout());

        tracing::info!(
            jump_capacity = config.jump_stack.capacity,
            buffer = capacity,
            channel = ?config.channel.kind,
            clock = ?config.clock.source,
            "platform hooks configured"
        );

        Ok(Platform::new(JumpStack::new(config.jump_stack.capacity), output)
            .with_clock(clock::from_config(&config.clock))
            .with_random(random::from_config(&config.rng)))
    }

    pub fn new(jump: JumpStack, output: OutputAggregator<C>) -> Self {
        Self {
            jump,
            output: SharedOutput::new(output),
            heap: Box::new(SystemHeap::new()),
            clock: Box::new(clock::ZeroClock),
            rng: RefCell::new(Box::new(random::FixedRandom)),
            at_exit: RefCell::new(Vec::new()),
        }
    }

    pub fn with_heap(mut self, heap: Box<dyn Heap>) -> Self {
        self.heap = heap;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_random(mut self, rng: Box<dyn RandomSource>) -> Self {
        self.rng = RefCell::new(rng);
        self
    }

    pub fn jump_stack(&self) -> &JumpStack {
        &self.jump
    }

    pub fn output(&self) -> &SharedOutput<C> {
        &self.output
    }

    // --- test isolation ---

    /// `setjmp` hook: run `f` under a new jump context.
    ///
    /// Stack exhaustion aborts the process with a diagnostic.
    pub fn run_protected<F: FnOnce()>(&self, f: F) -> Outcome {
        match self.try_run_protected(f) {
            Ok(outcome) => outcome,
            Err(e) => self.fatal(&e),
        }
    }

    pub fn try_run_protected<F: FnOnce()>(&self, f: F) -> PlatformResult<Outcome> {
        Ok(self.jump.run_protected(f)?)
    }

    /// `longjmp` hook.
    pub fn escape(&self) -> ! {
        if self.jump.depth() == 0 {
            self.fatal(&JumpError::NoActiveContext.into());
        }
        self.jump.raise_escape()
    }

    /// `restore jump buffer` hook.
    pub fn restore_context(&self) {
        if let Err(e) = self.jump.restore_context() {
            self.fatal(&e.into());
        }
    }

    /// Log, push out whatever output is pending, and abort.
    pub fn fatal(&self, err: &PlatformError) -> ! {
        let depth = self.jump.depth();
        tracing::error!(error = %err, depth, "fatal platform error");
        let diagnostic = format!("FATAL: {err} (jump depth {depth})");
        eprintln!("labwired-utest: {diagnostic}");
        let _ = self.output.flush();
        let _ = self.output.write_line(&diagnostic);
        std::process::abort()
    }

    // --- console ---

    pub fn putchar(&self, c: u8) -> u8 {
        self.output.write_char(c)
    }

    pub fn flush(&self) -> PlatformResult<usize> {
        Ok(self.output.flush()?)
    }

    pub fn output_stats(&self) -> OutputStats {
        self.output.stats()
    }

    // --- files ---

    pub fn fopen(&self, filename: &str, _flag: &str) -> PlatformResult<PlatformFile> {
        tracing::debug!(filename, "fopen requested");
        Err(PlatformError::Unsupported("file open"))
    }

    pub fn fputs(&self, _s: &str, _file: PlatformFile) {}

    pub fn fclose(&self, _file: PlatformFile) {}

    // --- process ---

    pub fn working_environment(&self) -> WorkingEnvironment {
        WorkingEnvironment::Eclipse
    }

    pub fn fork(&self) -> i32 {
        0
    }

    pub fn wait_pid(&self, _pid: i32, _status: &mut i32, _options: i32) -> i32 {
        0
    }

    /// There is no fork, so a test cannot run in its own process. Returns the
    /// failure the harness records in place of running it.
    pub fn run_test_in_separate_process(&self) -> &'static str {
        FORK_UNSUPPORTED
    }

    /// Register `f` to run at [`Platform::shutdown`]. Returns 0 like `atexit`.
    pub fn at_exit(&self, f: Box<dyn FnOnce()>) -> i32 {
        self.at_exit.borrow_mut().push(f);
        0
    }

    /// Run exit callbacks, most recently registered first, and flush output.
    pub fn shutdown(&self) -> PlatformResult<usize> {
        loop {
            let next = self.at_exit.borrow_mut().pop();
            match next {
                Some(f) => f(),
                None => break,
            }
        }
        self.flush()
    }

    // --- time ---

    pub fn time_in_millis(&self) -> u64 {
        self.clock.millis()
    }

    pub fn time_string(&self) -> String {
        clock::time_string(self.clock.millis())
    }

    // --- heap ---

    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.heap.allocate(size)
    }

    /// # Safety
    ///
    /// `ptr` must have come from this platform's heap and not been freed.
    pub unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        self.heap.reallocate(ptr, size)
    }

    /// # Safety
    ///
    /// `ptr` must have come from this platform's heap and not been freed.
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        self.heap.free(ptr)
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    // --- memory ---

    /// Compares the common prefix of `a` and `b` like `memcmp`.
    pub fn memcmp(&self, a: &[u8], b: &[u8]) -> i32 {
        let len = a.len().min(b.len());
        match a[..len].cmp(&b[..len]) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    pub fn memset(&self, dst: &mut [u8], value: u8) {
        dst.fill(value);
    }

    /// Copies as many bytes as fit and returns the count.
    pub fn memcpy(&self, dst: &mut [u8], src: &[u8]) -> usize {
        let len = dst.len().min(src.len());
        dst[..len].copy_from_slice(&src[..len]);
        len
    }

    // --- math ---

    pub fn fabs(&self, d: f64) -> f64 {
        d.abs()
    }

    pub fn is_nan(&self, d: f64) -> bool {
        d.is_nan()
    }

    pub fn is_inf(&self, d: f64) -> bool {
        d.is_infinite()
    }

    // --- rng ---

    pub fn srand(&self, seed: u32) {
        self.rng.borrow_mut().seed(seed);
    }

    pub fn rand(&self) -> i32 {
        self.rng.borrow_mut().next()
    }

    // --- mutex ---

    // Tests run on a single execution context; shared output has its own lock.
    pub fn mutex_create(&self) -> PlatformMutex {
        PlatformMutex(0)
    }

    pub fn mutex_lock(&self, _mutex: PlatformMutex) {}

    pub fn mutex_unlock(&self, _mutex: PlatformMutex) {}

    pub fn mutex_destroy(&self, _mutex: PlatformMutex) {}
}
