// Copyright 2025. The evloop Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::time::Duration;

use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::promise::Promise;

/// Suspends the current task until `duration` has elapsed on the ambient
/// loop's clock.
///
/// # Errors
///
/// [`Error::NoRunningLoop`][crate::Error::NoRunningLoop] outside a loop
/// callback, or [`Error::Cancelled`][crate::Error::Cancelled] when the sleep
/// is cancelled before the deadline.
pub async fn sleep(duration: Duration) -> Result<()> {
    let event_loop = EventLoop::current()?;
    let promise: Promise<()> = Promise::new(&event_loop);

    let handle = {
        let promise = promise.clone();
        event_loop.call_later(duration, move || {
            let _ = promise.set_result(());
        })
    };
    {
        // Cancelling the sleep drops the pending timer with it.
        let handle = handle.clone();
        promise.set_cancel_hook(move |_| {
            handle.cancel();
            false
        });
    }

    promise.wait().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::test_util::init_tracing;
    use std::future::Future;
    use std::time::Instant;

    #[test]
    fn zero_duration_sleep_completes() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        event_loop
            .run(async {
                sleep(Duration::ZERO).await?;
                Ok::<_, Error>(())
            })
            .unwrap();
    }

    #[test]
    fn sequential_sleeps_accumulate() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();

        let begin = Instant::now();
        event_loop
            .run(async {
                sleep(Duration::from_millis(20)).await?;
                sleep(Duration::from_millis(20)).await?;
                Ok::<_, Error>(())
            })
            .unwrap();
        assert!(begin.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn sleep_outside_a_loop_fails() {
        let _trace = init_tracing();
        // Poll the future directly, with no ambient loop installed.
        let mut fut = Box::pin(sleep(Duration::from_millis(1)));
        let waker = std::task::Waker::noop();
        let mut cx = std::task::Context::from_waker(waker);
        match fut.as_mut().poll(&mut cx) {
            std::task::Poll::Ready(Err(Error::NoRunningLoop)) => {}
            other => panic!("expected NoRunningLoop, got {other:?}"),
        }
    }
}
