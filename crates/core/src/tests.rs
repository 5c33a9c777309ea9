#[cfg(test)]
mod tests {
    use crate::channel::RecordingChannel;
    use crate::jump::{JumpStack, Outcome};
    use crate::output::OutputAggregator;
    use crate::runner::{TestCase, TestRunner};
    use crate::{JumpError, OverflowPolicy, Platform};
    use std::cell::Cell;

    fn sample(i: usize) -> u8 {
        b'a' + (i % 26) as u8
    }

    #[test]
    fn test_nesting_up_to_capacity() {
        let stack = JumpStack::new(3);
        let mut deepest = 0;
        let outcome = stack
            .run_protected(|| {
                stack
                    .run_protected(|| {
                        stack
                            .run_protected(|| deepest = stack.depth())
                            .unwrap();
                    })
                    .unwrap();
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(deepest, 3);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_one_past_capacity_is_refused() {
        let stack = JumpStack::new(2);
        let mut refused = None;
        stack
            .run_protected(|| {
                stack
                    .run_protected(|| refused = Some(stack.run_protected(|| {})))
                    .unwrap();
            })
            .unwrap();
        assert_eq!(
            refused,
            Some(Err(JumpError::Exhausted {
                depth: 2,
                capacity: 2
            }))
        );
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_repeated_escapes_leave_no_frames() {
        let stack = JumpStack::new(2);
        for _ in 0..100 {
            assert_eq!(
                stack.run_protected(|| stack.raise_escape()).unwrap(),
                Outcome::Escaped
            );
        }
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_inner_escape_resumes_outer() {
        let stack = JumpStack::new(2);
        let steps = Cell::new(0);
        let outer = stack
            .run_protected(|| {
                steps.set(steps.get() + 1);
                let inner = stack.run_protected(|| {
                    stack.raise_escape();
                });
                assert_eq!(inner, Ok(Outcome::Escaped));
                assert_eq!(stack.depth(), 1);
                steps.set(steps.get() + 1);
            })
            .unwrap();
        assert_eq!(outer, Outcome::Completed);
        assert_eq!(steps.get(), 2);
    }

    #[test]
    fn test_overflow_keeps_tail_after_restart() {
        let channel = RecordingChannel::new();
        let mut out = OutputAggregator::new(channel.clone(), 256);
        let written: Vec<u8> = (0..300).map(sample).collect();
        out.write_bytes(&written);

        assert_eq!(out.cursor(), 45);
        assert_eq!(out.pending(), &written[255..]);
        assert_eq!(out.stats().dropped, 255);

        assert_eq!(out.flush().unwrap(), 45);
        assert_eq!(channel.transfers(), vec![written[255..].to_vec()]);
    }

    #[test]
    fn test_flush_on_full_sends_every_byte() {
        let channel = RecordingChannel::new();
        let mut out =
            OutputAggregator::new(channel.clone(), 8).with_policy(OverflowPolicy::FlushOnFull);
        let written: Vec<u8> = (0..20).map(sample).collect();
        out.write_bytes(&written);
        out.flush().unwrap();

        assert_eq!(channel.transmitted(), written);
        assert!(channel.transfers().iter().all(|t| t.len() <= 7));
        assert_eq!(out.stats().dropped, 0);
    }

    #[test]
    fn test_empty_flush_is_zero_length_transfer() {
        let channel = RecordingChannel::new();
        let mut out = OutputAggregator::new(channel.clone(), 16);
        assert_eq!(out.flush().unwrap(), 0);
        assert_eq!(channel.transfers(), vec![Vec::<u8>::new()]);
        assert_eq!(channel.acquisitions(), 1);
        assert!(!channel.is_held());
    }

    #[test]
    fn test_flushes_are_separate_transfers() {
        let channel = RecordingChannel::new();
        let mut out = OutputAggregator::new(channel.clone(), 16);
        out.write_bytes(b"abc");
        out.flush().unwrap();
        out.write_bytes(b"de");
        out.flush().unwrap();
        assert_eq!(channel.transfers(), vec![b"abc".to_vec(), b"de".to_vec()]);
    }

    #[test]
    fn test_double_flush() {
        let channel = RecordingChannel::new();
        let mut out = OutputAggregator::new(channel.clone(), 16);
        out.write_bytes(b"xyz");
        assert_eq!(out.flush().unwrap(), 3);
        assert_eq!(out.flush().unwrap(), 0);
        assert_eq!(channel.transfers(), vec![b"xyz".to_vec(), Vec::new()]);
    }

    #[test]
    fn test_failed_flush_releases_and_clears() {
        let channel = RecordingChannel::new();
        let mut out = OutputAggregator::new(channel.clone(), 16);
        channel.fail_next(1);
        out.write_bytes(b"gone");
        assert!(out.flush().is_err());
        assert!(!channel.is_held());
        assert_eq!(out.cursor(), 0);
        assert_eq!(out.stats().lost, 4);

        out.write_bytes(b"ok");
        assert_eq!(out.flush().unwrap(), 2);
        assert_eq!(channel.transfers(), vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_failing_test_does_not_stop_the_run() {
        let channel = RecordingChannel::new();
        let platform = Platform::new(JumpStack::new(2), OutputAggregator::new(channel.clone(), 128));
        let mut runner = TestRunner::new();
        for i in 0..5 {
            runner.add(TestCase::new("loop", format!("case{i}"), move |t| {
                t.check(i % 2 == 0, "odd case");
            }));
        }

        let summary = runner.run(&platform);
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(platform.jump_stack().depth(), 0);
        assert_eq!(channel.transfers().len(), 6);
    }
}
