use labwired_utest_config::{ClockConfig, ClockSource};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// Millisecond time source handed to the harness.
pub trait Clock {
    fn millis(&self) -> u64;
}

/// For targets without a usable timer: time never advances.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZeroClock;

impl Clock for ZeroClock {
    fn millis(&self) -> u64 {
        0
    }
}

/// Scheduler tick counter running at `tick_rate_hz`.
#[derive(Debug, Clone)]
pub struct TickClock {
    start: Instant,
    tick_rate_hz: u32,
}

impl TickClock {
    pub fn new(tick_rate_hz: u32) -> Self {
        Self {
            start: Instant::now(),
            tick_rate_hz: tick_rate_hz.max(1),
        }
    }

    pub fn ticks(&self) -> u64 {
        let elapsed = self.start.elapsed();
        (elapsed.as_micros() * self.tick_rate_hz as u128 / 1_000_000) as u64
    }
}

impl Clock for TickClock {
    fn millis(&self) -> u64 {
        ticks_to_millis(self.ticks(), self.tick_rate_hz)
    }
}

/// Tick counter advanced by hand. Clones share the same counter.
#[derive(Debug, Clone)]
pub struct ManualClock {
    ticks: Rc<Cell<u64>>,
    tick_rate_hz: u32,
}

impl ManualClock {
    pub fn new(tick_rate_hz: u32) -> Self {
        Self {
            ticks: Rc::new(Cell::new(0)),
            tick_rate_hz: tick_rate_hz.max(1),
        }
    }

    pub fn advance(&self, ticks: u64) {
        self.ticks.set(self.ticks.get() + ticks);
    }
}

impl Clock for ManualClock {
    fn millis(&self) -> u64 {
        ticks_to_millis(self.ticks.get(), self.tick_rate_hz)
    }
}

fn ticks_to_millis(ticks: u64, tick_rate_hz: u32) -> u64 {
    ticks * 1000 / tick_rate_hz as u64
}

pub fn from_config(config: &ClockConfig) -> Box<dyn Clock> {
    match config.source {
        ClockSource::Zero => Box::new(ZeroClock),
        ClockSource::Tick => Box::new(TickClock::new(config.tick_rate_hz)),
    }
}

/// Human readable uptime, used where a desktop harness would print a date.
pub fn time_string(millis: u64) -> String {
    format!("T+{}.{:03}s", millis / 1000, millis % 1000)
}
