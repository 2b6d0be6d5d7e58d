// Copyright 2025. The evloop Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::{CancelReason, Error, Result};
use crate::event_loop::{EventLoop, WeakEventLoop};
use crate::promise::{DynPromise, Promise, Wait};

/// A [`Promise`] whose producer is a driven suspendable computation.
///
/// The computation is an ordinary [`Future`] resolving to `Result<T, Error>`.
/// It must suspend only on this runtime's promises (via
/// [`Promise::wait`]); each dispatch advances it exactly one poll, and the
/// completed child's value or error is observed by the `wait` future it is
/// parked on. Returning `Ok` resolves the task, returning `Err` stores the
/// failure, and a caught-or-injected [`Error::Cancelled`] finishes it as
/// cancelled.
pub struct Task<T: 'static> {
    promise: Promise<T>,
    core: Rc<Core<T>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Scheduled,
    Running,
    Suspended,
    Finished,
}

type Computation<T> = Pin<Box<dyn Future<Output = Result<T>>>>;

struct Core<T: 'static> {
    /// Weak so a queued step closure never keeps the loop alive through the
    /// scheduler that holds it.
    event_loop: WeakEventLoop,
    promise: Promise<T>,
    state: Cell<RunState>,
    computation: RefCell<Option<Computation<T>>>,
    ctx: Rc<TaskContext>,
    /// Children awaited by the current suspension, kept for cancellation
    /// forwarding. The reverse edge (child to task) is weak.
    awaited: RefCell<Vec<Rc<dyn DynPromise>>>,
    /// Incremented on every suspension; wake edges carry the generation they
    /// were created for, so a stale edge can never re-enqueue the task.
    wake_generation: Cell<u64>,
}

/// Ambient per-step state the `Wait` future communicates through.
pub(crate) struct TaskContext {
    awaited: RefCell<Vec<Rc<dyn DynPromise>>>,
    pending_cancel: RefCell<Option<CancelReason>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<TaskContext>>> = const { RefCell::new(None) };
}

/// The context of the task currently being stepped on this thread, if any.
pub(crate) fn current() -> Option<Rc<TaskContext>> {
    CURRENT.with(|slot| slot.borrow().clone())
}

struct ContextGuard {
    previous: Option<Rc<TaskContext>>,
}

fn enter(ctx: Rc<TaskContext>) -> ContextGuard {
    let previous = CURRENT.with(|slot| slot.borrow_mut().replace(ctx));
    ContextGuard { previous }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Stored on a task whose computation panicked.
#[derive(Debug)]
struct ComputationPanicked {
    message: String,
}

impl fmt::Display for ComputationPanicked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task computation panicked: {}", self.message)
    }
}

impl std::error::Error for ComputationPanicked {}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

// === impl TaskContext ===

impl TaskContext {
    fn new() -> Self {
        Self {
            awaited: RefCell::new(Vec::new()),
            pending_cancel: RefCell::new(None),
        }
    }

    pub(crate) fn record_await(&self, promise: Rc<dyn DynPromise>) {
        self.awaited.borrow_mut().push(promise);
    }

    /// Consumes a requested cancellation; it is observed exactly once.
    pub(crate) fn take_cancellation(&self) -> Option<CancelReason> {
        self.pending_cancel.borrow_mut().take()
    }

    fn set_cancellation(&self, reason: CancelReason) {
        let mut slot = self.pending_cancel.borrow_mut();
        // The first request wins; repeated cancels don't overwrite it.
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    fn peek_cancellation(&self) -> Option<CancelReason> {
        self.pending_cancel.borrow().clone()
    }

    fn drain_awaited(&self) -> Vec<Rc<dyn DynPromise>> {
        std::mem::take(&mut *self.awaited.borrow_mut())
    }
}

// === impl Task ===

impl<T> Task<T> {
    pub(crate) fn spawn<F>(event_loop: &EventLoop, computation: F) -> Self
    where
        F: Future<Output = Result<T>> + 'static,
    {
        let promise = Promise::new(event_loop);
        let core = Rc::new(Core {
            event_loop: event_loop.downgrade(),
            promise: promise.clone(),
            state: Cell::new(RunState::Scheduled),
            computation: RefCell::new(Some(Box::pin(computation))),
            ctx: Rc::new(TaskContext::new()),
            awaited: RefCell::new(Vec::new()),
            wake_generation: Cell::new(0),
        });

        // Cancelling the task's promise requests cancellation of the
        // computation instead of transitioning the cell directly; the cell
        // completes once the computation observes the request.
        let weak = Rc::downgrade(&core);
        promise.set_cancel_hook(move |reason| match weak.upgrade() {
            Some(core) => {
                Core::request_cancel(&core, reason.clone());
                true
            }
            None => false,
        });

        Core::enqueue_step(&core);
        Self { promise, core }
    }

    /// The underlying completion cell.
    pub fn promise(&self) -> &Promise<T> {
        &self.promise
    }

    pub fn is_finished(&self) -> bool {
        self.promise.is_finished()
    }

    pub fn result(&self) -> Result<Rc<T>> {
        self.promise.result()
    }

    pub fn wait(&self) -> Wait<T> {
        self.promise.wait()
    }

    /// Requests cooperative cancellation. The computation observes it at its
    /// next suspension point and may catch it for cleanup before re-raising
    /// or resolving.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if the task already finished.
    pub fn cancel(&self, reason: Option<&str>) -> Result<()> {
        self.promise.cancel(reason)
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            core: self.core.clone(),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.core.state.get())
            .field("promise", &self.promise)
            .finish()
    }
}

// === impl Core ===

impl<T> Core<T> {
    fn enqueue_step(core: &Rc<Self>) {
        let Some(event_loop) = core.event_loop.upgrade() else {
            return;
        };
        core.state.set(RunState::Scheduled);
        let stepped = core.clone();
        event_loop.call_soon(move || Core::step(&stepped));
    }

    /// Advances the computation by one poll.
    fn step(core: &Rc<Self>) {
        if core.promise.is_finished() {
            return;
        }
        if core.state.get() == RunState::Running {
            debug_assert!(false, "task stepped while already running");
            return;
        }
        core.state.set(RunState::Running);

        let poll = {
            let guard = enter(core.ctx.clone());
            let mut slot = core.computation.borrow_mut();
            let Some(computation) = slot.as_mut() else {
                return;
            };
            let poll = catch_unwind(AssertUnwindSafe(|| {
                computation
                    .as_mut()
                    .poll(&mut Context::from_waker(Waker::noop()))
            }));
            drop(guard);
            poll
        };

        // Everything the poll recorded, drained unconditionally: on Pending
        // these are the live awaits, on completion they are leftovers from a
        // combinator whose race was decided within the same poll and must be
        // released, not kept on the finished task.
        let children = core.ctx.drain_awaited();

        match poll {
            Err(payload) => {
                // A panicking computation fails its task like any other
                // error, so awaiters observe it instead of hanging.
                let message = panic_message(&*payload);
                tracing::error!("task computation panicked: {message}");
                Self::release_abandoned(children);
                Core::finish(core, Err(Error::other(ComputationPanicked { message })));
            }
            Ok(Poll::Ready(outcome)) => {
                Self::release_abandoned(children);
                Core::finish(core, outcome);
            }
            Ok(Poll::Pending) => {
                if children.is_empty() {
                    // Suspended on something the loop cannot wake.
                    Core::finish(
                        core,
                        Err(Error::InvalidState(
                            "task suspended without awaiting a runtime promise",
                        )),
                    );
                    return;
                }

                core.state.set(RunState::Suspended);
                let generation = core.wake_generation.get() + 1;
                core.wake_generation.set(generation);
                *core.awaited.borrow_mut() = children.clone();

                // A cancellation that arrived while running is forwarded to
                // the children we just parked on.
                if let Some(reason) = core.ctx.peek_cancellation() {
                    for child in &children {
                        child.cancel_forward(reason.clone());
                    }
                }

                for child in children {
                    let weak = Rc::downgrade(core);
                    child.on_wake(Box::new(move || {
                        if let Some(core) = weak.upgrade() {
                            Core::wake(&core, generation);
                        }
                    }));
                }
            }
        }
    }

    /// Releases awaits abandoned by a poll that completed the task. A
    /// best-effort cancellation lets their owners disarm whatever backs them
    /// (a readiness watch, a timer) instead of staying armed forever.
    fn release_abandoned(children: Vec<Rc<dyn DynPromise>>) {
        for child in children {
            if !child.is_finished() {
                child.cancel_forward(CancelReason::new("await abandoned"));
            }
        }
    }

    /// Resumes the task after a child completed. Runs inside the loop
    /// callback the child's completion scheduled, so stepping directly keeps
    /// "one `call_soon` per transition to runnability".
    fn wake(core: &Rc<Self>, generation: u64) {
        if core.state.get() != RunState::Suspended || core.wake_generation.get() != generation {
            return;
        }
        core.awaited.borrow_mut().clear();
        Core::step(core);
    }

    fn finish(core: &Rc<Self>, outcome: Result<T>) {
        core.state.set(RunState::Finished);
        core.computation.borrow_mut().take();
        core.awaited.borrow_mut().clear();
        match outcome {
            Ok(value) => {
                let _ = core.promise.set_result(value);
            }
            Err(Error::Cancelled(reason)) => core.promise.finish_cancelled(reason),
            Err(err) => {
                let _ = core.promise.set_exception(err);
            }
        }
    }

    fn request_cancel(core: &Rc<Self>, reason: CancelReason) {
        if core.state.get() == RunState::Finished {
            return;
        }
        core.ctx.set_cancellation(reason.clone());

        if core.state.get() == RunState::Suspended {
            // Best-effort propagation into in-flight children; whichever of
            // completion or cancellation happens first resumes the task.
            let children: Vec<_> = core.awaited.borrow().clone();
            for child in children {
                child.cancel_forward(reason.clone());
            }
        }
        // Scheduled tasks already have a step queued, and a running task
        // observes the request at its next suspension point.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::init_tracing;

    #[test]
    fn task_resolves_with_its_return_value() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let out = event_loop.run(async { Ok::<_, Error>(41 + 1) }).unwrap();
        assert_eq!(*out, 42);
    }

    #[test]
    fn child_error_is_injected_into_the_awaiting_task() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let lp = event_loop.clone();

        let out = event_loop.run(async move {
            let child: Task<u32> = lp.spawn(async {
                Err(Error::other(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "boom",
                )))
            });
            child.wait().await
        });

        match out {
            Err(Error::Other(err)) => assert_eq!(err.to_string(), "boom"),
            other => panic!("expected the child failure, got {other:?}"),
        }
    }

    #[test]
    fn awaiting_an_already_completed_promise_resumes_next_step() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let lp = event_loop.clone();

        let out = event_loop
            .run(async move {
                let promise: Promise<&str> = Promise::new(&lp);
                promise.set_result("done").unwrap();
                promise.wait().await
            })
            .unwrap();
        assert_eq!(**out, "done");
    }

    #[test]
    fn cancelling_a_suspended_task_cancels_its_child_promise() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let lp = event_loop.clone();

        let out = event_loop
            .run(async move {
                let gate: Promise<()> = Promise::new(&lp);
                let child: Task<()> = lp.spawn({
                    let gate = gate.clone();
                    async move {
                        gate.wait().await?;
                        Ok(())
                    }
                });

                // Let the child park on the gate, then cancel it.
                crate::time::sleep(std::time::Duration::from_millis(5)).await?;
                child.cancel(Some("not needed")).unwrap();

                let child_outcome = child.wait().await;
                assert!(matches!(child_outcome, Err(Error::Cancelled(_))));
                // The cancellation reached the promise the child was parked on.
                assert!(matches!(gate.result(), Err(Error::Cancelled(_))));
                Ok::<_, Error>(())
            })
            .unwrap();
        drop(out);
    }

    #[test]
    fn cancelled_task_may_clean_up_and_resolve() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let lp = event_loop.clone();

        let out = event_loop
            .run(async move {
                let child: Task<&str> = lp.spawn(async {
                    match crate::time::sleep(std::time::Duration::from_secs(60)).await {
                        Err(Error::Cancelled(_)) => Ok("cleaned up"),
                        other => {
                            other?;
                            Ok("slept")
                        }
                    }
                });

                crate::time::sleep(std::time::Duration::from_millis(5)).await?;
                child.cancel(None).unwrap();
                child.wait().await
            })
            .unwrap();
        assert_eq!(**out, "cleaned up");
    }

    #[test]
    fn panicking_computation_fails_its_task() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();

        let out: Result<Rc<u32>> = event_loop.run(async { panic!("kaboom") });
        match out {
            Err(Error::Other(err)) => {
                assert!(err.to_string().contains("kaboom"), "got: {err}");
            }
            other => panic!("expected the panic to fail the task, got {other:?}"),
        }
    }

    #[test]
    fn first_completed_child_wakes_a_multi_await() {
        let _trace = init_tracing();
        let event_loop = EventLoop::new().unwrap();
        let lp = event_loop.clone();

        // A hand-rolled "first of two" future polling two wait futures.
        struct First {
            a: Wait<&'static str>,
            b: Wait<&'static str>,
        }
        impl Future for First {
            type Output = Result<Rc<&'static str>>;
            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let this = self.get_mut();
                if let Poll::Ready(out) = Pin::new(&mut this.a).poll(cx) {
                    return Poll::Ready(out);
                }
                Pin::new(&mut this.b).poll(cx)
            }
        }

        let slow: Promise<&'static str> = Promise::new(&event_loop);
        let fast: Promise<&'static str> = Promise::new(&event_loop);
        let out = event_loop
            .run({
                let slow = slow.clone();
                let fast = fast.clone();
                async move {
                    {
                        let fast = fast.clone();
                        lp.call_later(std::time::Duration::from_millis(5), move || {
                            fast.set_result("fast").unwrap();
                        });
                    }
                    First {
                        a: slow.wait(),
                        b: fast.wait(),
                    }
                    .await
                }
            })
            .unwrap();
        assert_eq!(**out, "fast");
        // The losing await was released when the race was decided, not kept
        // on the finished task.
        assert!(matches!(slow.result(), Err(Error::Cancelled(_))));
    }
}
