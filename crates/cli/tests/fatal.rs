//! Contract violations abort the process. Each test re-runs itself in a child
//! process where the fatal path is taken, then inspects what the child left
//! behind.

use labwired_utest_core::channel::UartChannel;
use labwired_utest_core::runner::{TestCase, TestRunner};
use labwired_utest_core::{JumpStack, OutputAggregator, Platform};
use std::process::{Command, Output};

const CHILD_ENV: &str = "LABWIRED_UTEST_FATAL_CHILD";

fn is_child(test: &str) -> bool {
    std::env::var(CHILD_ENV).map_or(false, |v| v == test)
}

fn run_child(test: &str) -> Output {
    Command::new(std::env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, test)
        .output()
        .expect("Failed to re-run test binary")
}

fn assert_aborted(output: &Output) {
    assert!(!output.status.success());
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(output.status.signal(), Some(6), "expected SIGABRT");
    }
}

fn stdout_platform(capacity: usize) -> Platform<UartChannel> {
    Platform::new(
        JumpStack::new(capacity),
        OutputAggregator::new(UartChannel::stdout(None), 256),
    )
}

#[test]
fn test_exhaustion_aborts_with_depth() {
    const NAME: &str = "test_exhaustion_aborts_with_depth";
    if is_child(NAME) {
        let platform = stdout_platform(2);
        for c in b"pending report\n" {
            platform.putchar(*c);
        }
        platform.run_protected(|| {
            platform.run_protected(|| {
                platform.run_protected(|| {});
            });
        });
        unreachable!("exhaustion returned");
    }

    let output = run_child(NAME);
    assert_aborted(&output);

    let diagnostic = "Jump context stack exhausted at nesting depth 2 (capacity 2)";
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stdout.contains("pending report"));
    assert!(stdout.contains(diagnostic), "stdout: {stdout}");
    assert!(stderr.contains(diagnostic), "stderr: {stderr}");
    assert!(!stdout.contains("exhaustion returned"));
}

#[test]
fn test_restore_on_empty_stack_aborts() {
    const NAME: &str = "test_restore_on_empty_stack_aborts";
    if is_child(NAME) {
        stdout_platform(2).restore_context();
        return;
    }

    let output = run_child(NAME);
    assert_aborted(&output);
    assert!(String::from_utf8_lossy(&output.stdout)
        .contains("FATAL: No active jump context (jump depth 0)"));
}

#[test]
fn test_escape_at_depth_zero_aborts() {
    const NAME: &str = "test_escape_at_depth_zero_aborts";
    if is_child(NAME) {
        stdout_platform(2).escape();
    }

    let output = run_child(NAME);
    assert_aborted(&output);
    assert!(String::from_utf8_lossy(&output.stderr).contains("No active jump context"));
}

#[test]
fn test_escape_after_restore_stops_the_run() {
    const NAME: &str = "test_escape_after_restore_stops_the_run";
    if is_child(NAME) {
        let platform = stdout_platform(2);
        let mut runner = TestRunner::new();
        runner
            .add(TestCase::new("fatal", "restore_then_fail", |t| {
                t.restore().unwrap();
                t.fail("after restore");
            }))
            .add(TestCase::new("fatal", "never_runs", |_| {}));
        runner.run(&platform);
        return;
    }

    let output = run_child(NAME);
    assert_aborted(&output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("TEST(fatal, restore_then_fail)"));
    assert!(stdout.contains("Failure: after restore"));
    assert!(stdout.contains("Fatal: No active jump context"));
    assert!(!stdout.contains("never_runs"));
    assert!(String::from_utf8_lossy(&output.stderr)
        .contains("labwired-utest: fatal: No active jump context"));
}
