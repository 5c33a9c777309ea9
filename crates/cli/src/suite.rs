//! Built-in conformance cases for the platform hooks.

use labwired_utest_core::channel::RecordingChannel;
use labwired_utest_core::clock::time_string;
use labwired_utest_core::heap::{Heap, SystemHeap};
use labwired_utest_core::random::{FixedRandom, RandomSource};
use labwired_utest_core::runner::{TestCase, TestContext, TestRunner};
use labwired_utest_core::{JumpError, OutputAggregator, Outcome};
use std::cell::Cell;

pub fn conformance() -> TestRunner {
    let mut runner = TestRunner::new();
    runner
        .add(TestCase::new("jump", "escape_ends_protected_call", escape_ends_protected_call))
        .add(TestCase::new("jump", "inner_escape_resumes_outer", inner_escape_resumes_outer))
        .add(TestCase::new("jump", "restore_redirects_escape", restore_redirects_escape))
        .add(TestCase::new("jump", "exhaustion_is_reported", exhaustion_is_reported))
        .add(TestCase::new("output", "overflow_restarts_buffer", overflow_restarts_buffer))
        .add(TestCase::new("output", "empty_flush_is_a_transfer", empty_flush_is_a_transfer))
        .add(TestCase::new("heap", "accounting_balances", heap_accounting_balances))
        .add(TestCase::new("time", "uptime_string", uptime_string))
        .add(TestCase::new("rng", "fixed_source", fixed_source));
    runner
}

fn escape_ends_protected_call(t: &TestContext<'_>) {
    let outcome = t.protected(|inner| inner.escape());
    t.check_equal(Ok(Outcome::Escaped), outcome);
    t.check_equal(1, t.depth());
}

fn inner_escape_resumes_outer(t: &TestContext<'_>) {
    let resumed = Cell::new(false);
    let outer = t.protected(|a| {
        let inner = a.protected(|b| b.escape());
        a.check_equal(Ok(Outcome::Escaped), inner);
        resumed.set(true);
    });
    t.check_equal(Ok(Outcome::Completed), outer);
    t.check(resumed.get(), "outer call did not continue");
}

fn restore_redirects_escape(t: &TestContext<'_>) {
    let leaked = Cell::new(false);
    let outer = t.protected(|a| {
        let _ = a.protected(|b| {
            if b.restore().is_ok() {
                b.escape();
            }
        });
        leaked.set(true);
    });
    t.check_equal(Ok(Outcome::Escaped), outer);
    t.check(!leaked.get(), "escape after restore landed in the wrong frame");
    t.check_equal(1, t.depth());
}

// Returns the depth at which a new level was refused.
fn nest_until_refused(t: &TestContext<'_>) -> usize {
    let refused_at = Cell::new(0);
    match t.protected(|inner| refused_at.set(nest_until_refused(inner))) {
        Err(JumpError::Exhausted { depth, .. }) => depth,
        _ => refused_at.get(),
    }
}

fn exhaustion_is_reported(t: &TestContext<'_>) {
    let refused_at = nest_until_refused(t);
    t.check(refused_at >= 1, "stack never refused a level");
    t.check_equal(1, t.depth());
}

fn overflow_restarts_buffer(t: &TestContext<'_>) {
    let channel = RecordingChannel::new();
    let mut out = OutputAggregator::new(channel.clone(), 8);
    out.write_bytes(b"0123456789");
    t.check_equal(&b"789"[..], out.pending());
    t.check_equal(7, out.stats().dropped);
    t.check(out.flush().is_ok(), "flush failed");
    t.check_equal(b"789".to_vec(), channel.transmitted());
}

fn empty_flush_is_a_transfer(t: &TestContext<'_>) {
    let channel = RecordingChannel::new();
    let mut out = OutputAggregator::new(channel.clone(), 8);
    t.check(out.flush().is_ok(), "flush failed");
    t.check_equal(vec![Vec::<u8>::new()], channel.transfers());
    t.check(!channel.is_held(), "channel left acquired");
}

fn heap_accounting_balances(t: &TestContext<'_>) {
    let heap = SystemHeap::new();
    let block = heap.allocate(64);
    t.check(block.is_some(), "allocation failed");
    t.check_equal(64, heap.stats().in_use);
    // SAFETY: `block` came from `heap` and is freed once.
    unsafe { heap.free(block) };
    t.check_equal(0, heap.stats().in_use);
    t.check_equal(0, heap.stats().live_blocks);
}

fn uptime_string(t: &TestContext<'_>) {
    t.check_equal("T+1.234s".to_string(), time_string(1234));
}

fn fixed_source(t: &TestContext<'_>) {
    let mut rng = FixedRandom;
    rng.seed(42);
    t.check_equal(1, rng.next());
}
