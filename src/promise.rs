// Copyright 2025. The evloop Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::{CancelReason, Error, Result};
use crate::event_loop::{EventLoop, WeakEventLoop};
use crate::task;

/// A shared, at-most-once completion cell.
///
/// A `Promise` is shared between its producer (whoever resolves it) and any
/// number of awaiters; cloning shares the same cell. Completion callbacks are
/// always delivered through [`EventLoop::call_soon`], never synchronously, so
/// they run in a loop step no earlier than the one after completion.
///
/// Inside a task, `promise.wait().await` suspends the computation until the
/// cell completes.
pub struct Promise<T: 'static> {
    shared: Rc<Shared<T>>,
}

/// Token identifying a completion callback for [`Promise::remove_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

/// Future returned by [`Promise::wait`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<T: 'static> {
    shared: Rc<Shared<T>>,
}

pub(crate) enum Completion<T> {
    Resolved(Rc<T>),
    Failed(Error),
    Cancelled(CancelReason),
}

type DoneCallback<T> = Box<dyn FnOnce(&Promise<T>)>;
type CancelHook = Box<dyn FnMut(&CancelReason) -> bool>;

struct Shared<T: 'static> {
    /// Weak so a promise parked inside the loop's own scheduler can never
    /// keep the loop alive through a reference cycle.
    event_loop: WeakEventLoop,
    completion: RefCell<Option<Completion<T>>>,
    callbacks: RefCell<Vec<(CallbackId, DoneCallback<T>)>>,
    next_id: Cell<u64>,
    cancel_hook: RefCell<Option<CancelHook>>,
}

/// Type-erased view of a promise, used by the task driver to register wake
/// edges and forward cancellation without knowing the value type.
pub(crate) trait DynPromise {
    fn is_finished(&self) -> bool;

    /// Registers a completion callback that ignores the value.
    fn on_wake(&self, cb: Box<dyn FnOnce()>);

    /// Forwards a cancellation into this promise. Returns whether the
    /// cancellation took effect.
    fn cancel_forward(&self, reason: CancelReason) -> bool;
}

// === impl Completion ===

impl<T> Completion<T> {
    fn outcome(&self) -> Result<Rc<T>> {
        match self {
            Completion::Resolved(value) => Ok(value.clone()),
            Completion::Failed(err) => Err(err.clone()),
            Completion::Cancelled(reason) => Err(Error::Cancelled(reason.clone())),
        }
    }
}

// === impl Promise ===

impl<T> Promise<T> {
    pub fn new(event_loop: &EventLoop) -> Self {
        Self {
            shared: Rc::new(Shared {
                event_loop: event_loop.downgrade(),
                completion: RefCell::new(None),
                callbacks: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
                cancel_hook: RefCell::new(None),
            }),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.shared.completion.borrow().is_some()
    }

    /// The completed value, shared with every other awaiter.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] while the promise is pending, the stored error
    /// after [`Promise::set_exception`], and [`Error::Cancelled`] after
    /// cancellation.
    pub fn result(&self) -> Result<Rc<T>> {
        match &*self.shared.completion.borrow() {
            Some(completion) => completion.outcome(),
            None => Err(Error::InvalidState("result() called on a pending promise")),
        }
    }

    /// Resolves the promise.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if the promise is already completed; the
    /// stored completion is left unchanged.
    pub fn set_result(&self, value: T) -> Result<()> {
        self.complete(Completion::Resolved(Rc::new(value)))
    }

    /// Stores a failure to be re-raised to every awaiter.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if the promise is already completed.
    pub fn set_exception(&self, err: Error) -> Result<()> {
        self.complete(Completion::Failed(err))
    }

    /// Requests cancellation of the promise.
    ///
    /// If a cancellation hook is installed it may take ownership of the
    /// request (a task does, injecting the cancellation into its computation
    /// at the next suspension point); otherwise the promise transitions to
    /// cancelled immediately.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if the promise is already completed; the
    /// stored completion is left unchanged.
    pub fn cancel(&self, reason: Option<&str>) -> Result<()> {
        if self.is_finished() {
            return Err(Error::InvalidState("promise is already completed"));
        }
        self.cancel_with(CancelReason::from(reason));
        Ok(())
    }

    pub(crate) fn cancel_with(&self, reason: CancelReason) -> bool {
        if self.is_finished() {
            return false;
        }
        let hook = self.shared.cancel_hook.borrow_mut().take();
        if let Some(mut hook) = hook {
            let handled = hook(&reason);
            // A hook that declined keeps its registration so a later
            // cancellation attempt consults it again.
            if !self.is_finished() {
                *self.shared.cancel_hook.borrow_mut() = Some(hook);
            }
            if handled {
                return true;
            }
        }
        self.finish_cancelled(reason);
        true
    }

    /// Completes the promise as cancelled, bypassing the hook.
    pub(crate) fn finish_cancelled(&self, reason: CancelReason) {
        let _ = self.complete(Completion::Cancelled(reason));
    }

    /// Registers `hook` to be consulted by [`Promise::cancel`]. The hook
    /// returns whether it took ownership of the cancellation.
    pub fn set_cancel_hook(&self, hook: impl FnMut(&CancelReason) -> bool + 'static) {
        *self.shared.cancel_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Adds a completion callback, fired exactly once via `call_soon`.
    ///
    /// Callbacks run in insertion order. Adding a callback to an already
    /// completed promise schedules it immediately.
    pub fn add_callback(&self, cb: impl FnOnce(&Promise<T>) + 'static) -> CallbackId {
        let id = CallbackId(self.shared.next_id.get());
        self.shared.next_id.set(id.0 + 1);

        if self.is_finished() {
            self.schedule_callback(Box::new(cb));
        } else {
            self.shared.callbacks.borrow_mut().push((id, Box::new(cb)));
        }
        id
    }

    /// Removes a not-yet-scheduled completion callback. Returns whether the
    /// callback was still registered.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.shared.callbacks.borrow_mut();
        let before = callbacks.len();
        callbacks.retain(|(registered, _)| *registered != id);
        callbacks.len() != before
    }

    pub fn wait(&self) -> Wait<T> {
        Wait {
            shared: self.shared.clone(),
        }
    }

    fn complete(&self, completion: Completion<T>) -> Result<()> {
        {
            let mut slot = self.shared.completion.borrow_mut();
            if slot.is_some() {
                return Err(Error::InvalidState("promise is already completed"));
            }
            *slot = Some(completion);
        }
        tracing::trace!(promise = ?self, "promise completed");

        // Copy the list out before scheduling so a callback registering
        // further callbacks never observes a half-drained list.
        let callbacks = std::mem::take(&mut *self.shared.callbacks.borrow_mut());
        for (_, cb) in callbacks {
            self.schedule_callback(cb);
        }
        // The producer side is decided; cancellation can no longer divert it.
        self.shared.cancel_hook.borrow_mut().take();
        Ok(())
    }

    fn schedule_callback(&self, cb: DoneCallback<T>) {
        let Some(event_loop) = self.shared.event_loop.upgrade() else {
            // The loop is gone; there is no step left to deliver into.
            tracing::trace!("dropping completion callback for a dead loop");
            return;
        };
        let promise = self.clone();
        event_loop.call_soon(move || cb(&promise));
    }

    fn state_name(&self) -> &'static str {
        match &*self.shared.completion.borrow() {
            None => "pending",
            Some(Completion::Resolved(_)) => "resolved",
            Some(Completion::Failed(_)) => "failed",
            Some(Completion::Cancelled(_)) => "cancelled",
        }
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state_name())
            .field("callbacks", &self.shared.callbacks.borrow().len())
            .finish()
    }
}

impl<T> DynPromise for Promise<T> {
    fn is_finished(&self) -> bool {
        Promise::is_finished(self)
    }

    fn on_wake(&self, cb: Box<dyn FnOnce()>) {
        self.add_callback(move |_| cb());
    }

    fn cancel_forward(&self, reason: CancelReason) -> bool {
        self.cancel_with(reason)
    }
}

// === impl Wait ===

impl<T> Future for Wait<T> {
    type Output = Result<Rc<T>>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(ctx) = task::current() else {
            // Outside a task step nothing will ever wake us up again, so a
            // pending promise cannot be waited on.
            return match &*self.shared.completion.borrow() {
                Some(completion) => Poll::Ready(completion.outcome()),
                None => Poll::Ready(Err(Error::OutsideTask)),
            };
        };

        // A requested cancellation is injected before any completed value:
        // the computation observes it at its next suspension point.
        if let Some(reason) = ctx.take_cancellation() {
            return Poll::Ready(Err(Error::Cancelled(reason)));
        }

        if let Some(completion) = &*self.shared.completion.borrow() {
            return Poll::Ready(completion.outcome());
        }

        ctx.record_await(Rc::new(Promise {
            shared: self.shared.clone(),
        }));
        Poll::Pending
    }
}

impl<T> fmt::Debug for Wait<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::drive;

    #[test]
    fn callbacks_run_in_insertion_order_in_a_later_step() {
        let event_loop = EventLoop::new().unwrap();
        let promise: Promise<u32> = Promise::new(&event_loop);
        let seen = Rc::new(RefCell::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            promise.add_callback(move |p| {
                assert_eq!(*p.result().unwrap(), 7);
                seen.borrow_mut().push(tag);
            });
        }

        let completed_in = Rc::new(Cell::new(0_u64));
        {
            let promise = promise.clone();
            let completed_in = completed_in.clone();
            let lp = event_loop.clone();
            event_loop.call_soon(move || {
                completed_in.set(lp.steps());
                promise.set_result(7).unwrap();
            });
        }

        drive(&event_loop, 4);
        assert_eq!(*seen.borrow(), vec!["first", "second"]);
        // Completion callbacks never run in the step that resolved the cell.
        assert!(completed_in.get() < event_loop.steps());
    }

    #[test]
    fn double_completion_is_rejected_and_state_unchanged() {
        let event_loop = EventLoop::new().unwrap();
        let promise: Promise<&str> = Promise::new(&event_loop);

        promise.set_result("kept").unwrap();
        assert!(matches!(
            promise.set_result("dropped"),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            promise.set_exception(Error::cancelled()),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(promise.cancel(None), Err(Error::InvalidState(_))));
        assert_eq!(*promise.result().unwrap(), "kept");
    }

    #[test]
    fn result_on_pending_is_an_error() {
        let event_loop = EventLoop::new().unwrap();
        let promise: Promise<()> = Promise::new(&event_loop);
        assert!(matches!(promise.result(), Err(Error::InvalidState(_))));
        assert!(!promise.is_finished());
    }

    #[test]
    fn cancelled_promise_never_delivers_a_result() {
        let event_loop = EventLoop::new().unwrap();
        let promise: Promise<u32> = Promise::new(&event_loop);

        promise.cancel(Some("gave up")).unwrap();
        assert!(promise.set_result(1).is_err());
        match promise.result() {
            Err(Error::Cancelled(reason)) => assert_eq!(reason.message(), Some("gave up")),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[test]
    fn add_callback_after_completion_still_fires() {
        let event_loop = EventLoop::new().unwrap();
        let promise: Promise<u32> = Promise::new(&event_loop);
        promise.set_result(3).unwrap();

        let fired = Rc::new(Cell::new(false));
        {
            let fired = fired.clone();
            promise.add_callback(move |_| fired.set(true));
        }
        drive(&event_loop, 2);
        assert!(fired.get());
    }

    #[test]
    fn removed_callbacks_never_fire() {
        let event_loop = EventLoop::new().unwrap();
        let promise: Promise<u32> = Promise::new(&event_loop);

        let fired = Rc::new(Cell::new(false));
        let id = {
            let fired = fired.clone();
            promise.add_callback(move |_| fired.set(true))
        };
        assert!(promise.remove_callback(id));
        assert!(!promise.remove_callback(id));

        promise.set_result(9).unwrap();
        drive(&event_loop, 2);
        assert!(!fired.get());
    }

    #[test]
    fn cancel_hook_can_take_ownership() {
        let event_loop = EventLoop::new().unwrap();
        let promise: Promise<u32> = Promise::new(&event_loop);

        let consulted = Rc::new(Cell::new(0));
        {
            let consulted = consulted.clone();
            promise.set_cancel_hook(move |_| {
                consulted.set(consulted.get() + 1);
                true
            });
        }

        promise.cancel(None).unwrap();
        assert_eq!(consulted.get(), 1);
        // The hook deferred the transition.
        assert!(!promise.is_finished());
    }
}
