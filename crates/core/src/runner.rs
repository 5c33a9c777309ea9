use crate::channel::Channel;
use crate::hooks::{Platform, FORK_UNSUPPORTED};
use crate::jump::{JumpStack, Outcome};
use crate::output::SharedOutput;
use crate::{ChannelError, JumpError};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::fmt::Debug;

/// Where report text goes.
pub trait ReportSink {
    fn put(&self, byte: u8);
    fn flush(&self) -> Result<usize, ChannelError>;

    fn print(&self, s: &str) {
        for byte in s.bytes() {
            self.put(byte);
        }
    }
}

impl<C: Channel> ReportSink for SharedOutput<C> {
    fn put(&self, byte: u8) {
        self.write_char(byte);
    }

    fn flush(&self) -> Result<usize, ChannelError> {
        SharedOutput::flush(self)
    }

    fn print(&self, s: &str) {
        self.write_str(s);
    }
}

/// Handed to every test body.
pub struct TestContext<'a> {
    jump: &'a JumpStack,
    out: &'a dyn ReportSink,
    checks: &'a Cell<u32>,
    failure: RefCell<Option<String>>,
}

impl<'a> TestContext<'a> {
    pub fn new(jump: &'a JumpStack, out: &'a dyn ReportSink, checks: &'a Cell<u32>) -> Self {
        Self {
            jump,
            out,
            checks,
            failure: RefCell::new(None),
        }
    }

    pub fn print(&self, s: &str) {
        self.out.print(s);
    }

    /// Record `message` as this test's failure and abort it.
    pub fn fail(&self, message: &str) -> ! {
        self.out.print("\n  Failure: ");
        self.out.print(message);
        self.out.print("\n");
        *self.failure.borrow_mut() = Some(message.to_string());
        self.raise()
    }

    /// Leave the innermost protected call without recording a failure.
    pub fn escape(&self) -> ! {
        self.raise()
    }

    fn raise(&self) -> ! {
        if self.jump.depth() == 0 {
            // The abort that follows must not swallow the report so far.
            self.out.print(&format!("\n  Fatal: {}\n", JumpError::NoActiveContext));
            let _ = self.out.flush();
        }
        self.jump.raise_escape()
    }

    pub fn check(&self, condition: bool, message: &str) {
        self.checks.set(self.checks.get() + 1);
        if !condition {
            self.fail(message);
        }
    }

    pub fn check_equal<T: PartialEq + Debug>(&self, expected: T, actual: T) {
        self.checks.set(self.checks.get() + 1);
        if expected != actual {
            self.fail(&format!("expected <{expected:?}> but was <{actual:?}>"));
        }
    }

    /// Run `f` isolated from this test: an escape inside it only ends `f`.
    pub fn protected(&self, f: impl FnOnce(&TestContext<'a>)) -> Result<Outcome, JumpError> {
        let inner = TestContext::new(self.jump, self.out, self.checks);
        self.jump.run_protected(|| f(&inner))
    }

    /// Drop the innermost jump context without escaping.
    pub fn restore(&self) -> Result<(), JumpError> {
        self.jump.restore_context()
    }

    pub fn depth(&self) -> usize {
        self.jump.depth()
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.borrow().clone()
    }
}

pub type TestBody = Box<dyn Fn(&TestContext<'_>)>;

pub struct TestCase {
    pub group: String,
    pub name: String,
    body: TestBody,
}

impl TestCase {
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        body: impl Fn(&TestContext<'_>) + 'static,
    ) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            body: Box::new(body),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub group: String,
    pub name: String,
    pub status: CaseStatus,
    /// `None` when the case was never invoked.
    pub outcome: Option<Outcome>,
    pub failure: Option<String>,
    pub elapsed_ms: u64,
    pub output_lost: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub cases: Vec<CaseReport>,
    pub passed: usize,
    pub failed: usize,
    pub checks: u32,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Runs each registered case under its own protected call.
#[derive(Default)]
pub struct TestRunner {
    cases: Vec<TestCase>,
    separate_process: bool,
    group_filter: Option<String>,
}

impl TestRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, case: TestCase) -> &mut Self {
        self.cases.push(case);
        self
    }

    /// Request per-test processes. Every case then fails without running.
    pub fn with_separate_process(mut self, enabled: bool) -> Self {
        self.separate_process = enabled;
        self
    }

    pub fn with_group_filter(mut self, group: Option<String>) -> Self {
        self.group_filter = group;
        self
    }

    pub fn cases(&self) -> impl Iterator<Item = &TestCase> {
        self.cases
            .iter()
            .filter(|case| self.group_filter.as_ref().map_or(true, |g| &case.group == g))
    }

    pub fn run<C: Channel>(&self, platform: &Platform<C>) -> RunSummary {
        let out = platform.output();
        let checks = Cell::new(0);
        let run_start = platform.time_in_millis();
        let mut summary = RunSummary::default();

        for case in self.cases() {
            let start = platform.time_in_millis();
            out.print(&format!("TEST({}, {})", case.group, case.name));

            let (outcome, failure) = if self.separate_process {
                out.print(&format!("\n  Failure: {FORK_UNSUPPORTED}\n"));
                (None, Some(platform.run_test_in_separate_process().to_string()))
            } else {
                let ctx = TestContext::new(platform.jump_stack(), out, &checks);
                let outcome = platform.run_protected(|| (case.body)(&ctx));
                let failure = match &outcome {
                    Outcome::Completed => None,
                    Outcome::Escaped => {
                        Some(ctx.failure().unwrap_or_else(|| "test aborted".to_string()))
                    }
                    Outcome::Panicked(message) => {
                        out.print(&format!("\n  Panic: {message}\n"));
                        Some(format!("panicked: {message}"))
                    }
                };
                (Some(outcome), failure)
            };

            if platform.jump_stack().depth() != 0 {
                tracing::warn!(
                    test = %case.name,
                    depth = platform.jump_stack().depth(),
                    "jump stack not balanced after test"
                );
            }

            let elapsed_ms = platform.time_in_millis().saturating_sub(start);
            out.print(&format!(" - {elapsed_ms} ms\n"));
            let output_lost = match out.flush() {
                Ok(_) => false,
                Err(e) => {
                    tracing::warn!(test = %case.name, error = %e, "test output lost");
                    true
                }
            };

            let status = if failure.is_none() {
                summary.passed += 1;
                CaseStatus::Passed
            } else {
                summary.failed += 1;
                CaseStatus::Failed
            };
            tracing::debug!(group = %case.group, test = %case.name, ?status, "test finished");

            summary.cases.push(CaseReport {
                group: case.group.clone(),
                name: case.name.clone(),
                status,
                outcome,
                failure,
                elapsed_ms,
                output_lost,
            });
        }

        summary.checks = checks.get();
        summary.elapsed_ms = platform.time_in_millis().saturating_sub(run_start);

        let total = summary.cases.len();
        if summary.is_success() {
            out.print(&format!(
                "\nOK ({total} tests, {} checks, {} ms)\n",
                summary.checks, summary.elapsed_ms
            ));
        } else {
            out.print(&format!(
                "\nErrors ({} failures, {total} tests, {} checks, {} ms)\n",
                summary.failed, summary.checks, summary.elapsed_ms
            ));
        }
        if let Err(e) = out.flush() {
            tracing::warn!(error = %e, "summary output lost");
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingChannel;
    use crate::output::OutputAggregator;

    fn platform() -> (Platform<RecordingChannel>, RecordingChannel) {
        let channel = RecordingChannel::new();
        let platform = Platform::new(
            JumpStack::new(4),
            OutputAggregator::new(channel.clone(), 256),
        );
        (platform, channel)
    }

    fn transcript(channel: &RecordingChannel) -> String {
        String::from_utf8(channel.transmitted()).unwrap()
    }

    #[test]
    fn test_pass_and_fail_cases() {
        let (platform, channel) = platform();
        let mut runner = TestRunner::new();
        runner
            .add(TestCase::new("math", "adds", |t| t.check_equal(4, 2 + 2)))
            .add(TestCase::new("math", "breaks", |t| {
                t.check(false, "deliberate");
                t.print("unreachable");
            }))
            .add(TestCase::new("math", "after_failure", |t| t.check(true, "ok")));

        let summary = runner.run(&platform);

        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.checks, 3);
        assert!(!summary.is_success());
        assert_eq!(summary.cases[1].outcome, Some(Outcome::Escaped));
        assert_eq!(summary.cases[1].failure.as_deref(), Some("deliberate"));
        assert_eq!(platform.jump_stack().depth(), 0);

        let text = transcript(&channel);
        assert!(text.contains("TEST(math, adds)"));
        assert!(text.contains("Failure: deliberate"));
        assert!(!text.contains("unreachable"));
        assert!(text.contains("Errors (1 failures, 3 tests, 3 checks"));
    }

    #[test]
    fn test_one_transfer_per_test_plus_summary() {
        let (platform, channel) = platform();
        let mut runner = TestRunner::new();
        runner
            .add(TestCase::new("g", "a", |_| {}))
            .add(TestCase::new("g", "b", |_| {}));
        assert!(runner.run(&platform).is_success());

        let transfers = channel.transfers();
        assert_eq!(transfers.len(), 3);
        assert!(String::from_utf8_lossy(&transfers[2]).contains("OK (2 tests"));
    }

    #[test]
    fn test_check_equal_message() {
        let (platform, _) = platform();
        let mut runner = TestRunner::new();
        runner.add(TestCase::new("g", "eq", |t| t.check_equal("a", "b")));
        let summary = runner.run(&platform);
        assert_eq!(
            summary.cases[0].failure.as_deref(),
            Some("expected <\"a\"> but was <\"b\">")
        );
    }

    #[test]
    fn test_nested_failure_does_not_fail_outer() {
        let (platform, _) = platform();
        let mut runner = TestRunner::new();
        runner.add(TestCase::new("g", "nested", |t| {
            let inner = t.protected(|inner| inner.fail("inner only")).unwrap();
            t.check_equal(Outcome::Escaped, inner);
            t.check_equal(1, t.depth());
        }));
        let summary = runner.run(&platform);
        assert!(summary.is_success());
    }

    #[test]
    fn test_panicking_body_fails_case() {
        let (platform, channel) = platform();
        let mut runner = TestRunner::new();
        runner.add(TestCase::new("g", "panics", |_| panic!("index out of range")));
        let summary = runner.run(&platform);
        assert_eq!(summary.failed, 1);
        assert_eq!(
            summary.cases[0].outcome,
            Some(Outcome::Panicked("index out of range".to_string()))
        );
        assert!(transcript(&channel).contains("Panic: index out of range"));
    }

    #[test]
    fn test_separate_process_not_supported() {
        let (platform, _) = platform();
        let mut runner = TestRunner::new();
        runner.add(TestCase::new("g", "forked", |_| unreachable!()));
        let runner = runner.with_separate_process(true);
        let summary = runner.run(&platform);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cases[0].outcome, None);
        assert_eq!(summary.cases[0].failure.as_deref(), Some(FORK_UNSUPPORTED));
    }

    #[test]
    fn test_group_filter() {
        let (platform, _) = platform();
        let mut runner = TestRunner::new();
        runner
            .add(TestCase::new("keep", "a", |_| {}))
            .add(TestCase::new("skip", "b", |t| t.fail("filtered")));
        let runner = runner.with_group_filter(Some("keep".to_string()));
        assert_eq!(runner.cases().count(), 1);
        assert!(runner.run(&platform).is_success());
    }

    #[test]
    fn test_lost_output_is_reported() {
        let (platform, channel) = platform();
        channel.fail_next(1);
        let mut runner = TestRunner::new();
        runner.add(TestCase::new("g", "quiet", |t| t.print("hello")));
        let summary = runner.run(&platform);
        assert!(summary.is_success());
        assert!(summary.cases[0].output_lost);
        assert_eq!(platform.output_stats().failed_flushes, 1);
    }
}
