// Copyright 2025. The evloop Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::selector::{EventCallback, Fired, Interest, Selector, Wakeup};
use crate::time::Clock;
use std::os::unix::io::RawFd;

pub(crate) fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .set_default()
}

/// Steps the loop while scheduled callbacks remain, up to `max_steps`, so a
/// test never parks in an unbounded select.
pub(crate) fn drive(event_loop: &EventLoop, max_steps: usize) {
    for _ in 0..max_steps {
        if event_loop.pending_callbacks() == 0 {
            break;
        }
        event_loop.step().expect("loop step failed");
    }
}

/// A clock advanced explicitly by the test.
#[derive(Debug, Clone)]
pub(crate) struct ManualClock {
    now: Rc<Cell<f64>>,
}

impl ManualClock {
    pub(crate) fn at(now: f64) -> Self {
        Self {
            now: Rc::new(Cell::new(now)),
        }
    }

    #[allow(dead_code, reason = "not every test advances its clock")]
    pub(crate) fn advance(&self, seconds: f64) {
        self.now.set(self.now.get() + seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.now.get()
    }

    fn resolution(&self) -> f64 {
        1e-3
    }
}

/// A selector double that records every requested budget and never reports
/// I/O.
pub(crate) struct RecordingSelector {
    budgets: Rc<RefCell<Vec<Option<Duration>>>>,
}

impl RecordingSelector {
    pub(crate) fn new() -> Self {
        Self {
            budgets: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub(crate) fn budgets(&self) -> Rc<RefCell<Vec<Option<Duration>>>> {
        self.budgets.clone()
    }
}

impl Selector for RecordingSelector {
    fn add_watch(&mut self, _fd: RawFd, _interest: Interest, _cb: EventCallback) -> Result<()> {
        Ok(())
    }

    fn stop_watch(
        &mut self,
        _fd: RawFd,
        _interest: Option<Interest>,
        _cb: Option<&EventCallback>,
    ) -> Result<()> {
        Ok(())
    }

    fn select(&mut self, timeout: Option<Duration>) -> Result<Vec<Fired>> {
        self.budgets.borrow_mut().push(timeout);
        Ok(Vec::new())
    }

    fn wakeup(&self) -> Wakeup {
        Wakeup::new(|| {})
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}
