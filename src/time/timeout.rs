// Copyright 2025. The evloop Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::promise::Promise;

/// Requires `promise` to complete before `duration` has elapsed.
///
/// Timeouts are not a scheduling primitive: this is a `call_later` that
/// cancels the promise when it fires first.
///
/// # Errors
///
/// [`Error::Elapsed`] when the deadline fires first, otherwise the promise's
/// own outcome.
pub async fn timeout<T: 'static>(duration: Duration, promise: Promise<T>) -> Result<Rc<T>> {
    let event_loop = EventLoop::current()?;

    let fired = Rc::new(Cell::new(false));
    let handle = {
        let promise = promise.clone();
        let fired = fired.clone();
        event_loop.call_later(duration, move || {
            fired.set(true);
            let _ = promise.cancel(Some("timed out"));
        })
    };

    let outcome = promise.wait().await;
    handle.cancel();

    match outcome {
        Err(Error::Cancelled(_)) if fired.get() => Err(Error::Elapsed),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::init_tracing;
    use crate::time::sleep;

    #[test]
    fn deadline_first_yields_elapsed() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let lp = event_loop.clone();

        let out: Result<Rc<()>> = event_loop.run(async move {
            let never: Promise<u32> = Promise::new(&lp);
            match timeout(Duration::from_millis(10), never).await {
                Err(Error::Elapsed) => Ok(()),
                other => panic!("expected Elapsed, got {other:?}"),
            }
        });
        out.unwrap();
    }

    #[test]
    fn completion_first_wins_and_the_timer_is_dropped() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let lp = event_loop.clone();

        let out = event_loop
            .run(async move {
                let prompt: Promise<&str> = Promise::new(&lp);
                {
                    let prompt = prompt.clone();
                    lp.call_later(Duration::from_millis(5), move || {
                        prompt.set_result("made it").unwrap();
                    });
                }
                let value = timeout(Duration::from_secs(60), prompt).await?;
                // The loop must not stay alive for the full minute.
                sleep(Duration::from_millis(10)).await?;
                Ok::<_, Error>(value)
            })
            .unwrap();
        assert_eq!(**out, "made it");
    }

    #[test]
    fn external_cancellation_is_not_reported_as_elapsed() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let lp = event_loop.clone();

        let out: Result<Rc<()>> = event_loop.run(async move {
            let victim: Promise<u32> = Promise::new(&lp);
            {
                let victim = victim.clone();
                lp.call_later(Duration::from_millis(5), move || {
                    victim.cancel(Some("external")).unwrap();
                });
            }
            match timeout(Duration::from_secs(60), victim).await {
                Err(Error::Cancelled(reason)) => {
                    assert_eq!(reason.message(), Some("external"));
                    Ok(())
                }
                other => panic!("expected the external cancellation, got {other:?}"),
            }
        });
        out.unwrap();
    }
}
