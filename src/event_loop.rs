// Copyright 2025. The evloop Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The loop composing clock, scheduler, selector and tasks.
//!
//! One [`EventLoop::step`] pops timers due within one clock tick, blocks the
//! selector for the computed budget, then dispatches early timers, I/O
//! callbacks and late timers, in that order. Early timers run before I/O so a
//! timer that became due before the select also observes its own effects
//! before any I/O-driven reaction; late timers absorb deadlines that fell
//! while the selector was blocking.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::net::Networking;
use crate::scheduler::{CallContext, Handle, Scheduler};
use crate::selector::{PollSelector, Selector, Wakeup};
use crate::task::Task;
use crate::time::{Clock, MonotonicClock};

thread_local! {
    static CURRENT: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

/// A panic that escaped a scheduled callback, as handed to the loop's
/// exception handler. The loop keeps running afterwards.
pub struct CallbackFailure {
    payload: Box<dyn Any + Send>,
    context: CallContext,
}

pub type ExceptionHandler = Box<dyn Fn(&CallbackFailure)>;

/// Configures an [`EventLoop`] before construction.
pub struct Builder {
    selector: Option<Box<dyn Selector>>,
    clock: Option<Box<dyn Clock>>,
    exception_handler: Option<ExceptionHandler>,
    debug: Option<bool>,
}

/// Clonable handle to a single-threaded cooperative event loop.
///
/// All methods must be called on the thread the loop runs on; the only
/// cross-thread entry point is the [`Wakeup`] returned by
/// [`EventLoop::wakeup`].
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

struct Inner {
    clock: Box<dyn Clock>,
    scheduler: RefCell<Scheduler>,
    selector: RefCell<Box<dyn Selector>>,
    wakeup: Wakeup,
    exception_handler: ExceptionHandler,
    debug: bool,
    interrupted: Arc<AtomicBool>,
    networking: RefCell<Option<Rc<Networking>>>,
    steps: Cell<u64>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.selector.get_mut().finalize();
    }
}

/// Non-owning loop handle.
///
/// Long-lived structures reachable from the loop itself (promises, the
/// networking singleton, armed watches) hold this instead of an [`EventLoop`]
/// so they never form a reference cycle that would keep the loop alive.
#[derive(Clone)]
pub(crate) struct WeakEventLoop {
    inner: std::rc::Weak<Inner>,
}

/// Keeps the SIGINT hook installed for the duration of a [`EventLoop::run`].
struct InterruptGuard {
    id: signal_hook::SigId,
}

// === impl CallbackFailure ===

impl CallbackFailure {
    /// The panic message, when it was a string payload.
    pub fn message(&self) -> &str {
        if let Some(message) = self.payload.downcast_ref::<&'static str>() {
            message
        } else if let Some(message) = self.payload.downcast_ref::<String>() {
            message
        } else {
            "callback panicked"
        }
    }

    /// The user context the callback was scheduled with.
    pub fn context(&self) -> &CallContext {
        &self.context
    }
}

impl fmt::Debug for CallbackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackFailure")
            .field("message", &self.message())
            .field("context", &self.context)
            .finish()
    }
}

// === impl Builder ===

impl Builder {
    pub fn new() -> Self {
        Self {
            selector: None,
            clock: None,
            exception_handler: None,
            debug: None,
        }
    }

    /// Replaces the default poll-backed selector.
    #[must_use]
    pub fn selector(mut self, selector: impl Selector + 'static) -> Self {
        self.selector = Some(Box::new(selector));
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    /// Routes panics escaping scheduled callbacks. The default logs them.
    #[must_use]
    pub fn exception_handler(mut self, handler: impl Fn(&CallbackFailure) + 'static) -> Self {
        self.exception_handler = Some(Box::new(handler));
        self
    }

    /// Enables verbose scheduling traces. Defaults to the `EVLOOP_DEBUG`
    /// environment variable when set, else to debug builds.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    /// # Errors
    ///
    /// Fails when the default selector cannot allocate its OS resources.
    pub fn build(self) -> Result<EventLoop> {
        let selector = match self.selector {
            Some(selector) => selector,
            None => Box::new(PollSelector::new()?),
        };
        let wakeup = selector.wakeup();
        let clock = self
            .clock
            .unwrap_or_else(|| Box::new(MonotonicClock::new()));
        let exception_handler = self
            .exception_handler
            .unwrap_or_else(|| Box::new(report_callback_failure));
        let debug = self.debug.unwrap_or_else(default_debug);

        Ok(EventLoop {
            inner: Rc::new(Inner {
                clock,
                scheduler: RefCell::new(Scheduler::new()),
                selector: RefCell::new(selector),
                wakeup,
                exception_handler,
                debug,
                interrupted: Arc::new(AtomicBool::new(false)),
                networking: RefCell::new(None),
                steps: Cell::new(0),
            }),
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_debug() -> bool {
    match std::env::var("EVLOOP_DEBUG") {
        Ok(value) => !matches!(value.as_str(), "" | "0" | "false"),
        Err(_) => cfg!(debug_assertions),
    }
}

fn report_callback_failure(failure: &CallbackFailure) {
    tracing::error!(context = ?failure.context(), "callback panicked: {}", failure.message());
}

// === impl EventLoop ===

impl EventLoop {
    /// A loop with the default selector, clock and exception handler.
    ///
    /// # Errors
    ///
    /// Fails when the selector cannot allocate its OS resources.
    pub fn new() -> Result<Self> {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The loop the currently executing callback belongs to.
    ///
    /// # Errors
    ///
    /// [`Error::NoRunningLoop`] outside of a callback dispatched by a loop.
    pub fn current() -> Result<Self> {
        CURRENT
            .with(|slot| slot.borrow().clone())
            .ok_or(Error::NoRunningLoop)
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.inner.clock
    }

    /// A cross-thread handle that interrupts a blocked step.
    pub fn wakeup(&self) -> Wakeup {
        self.inner.wakeup.clone()
    }

    /// Enqueues `callback` for the next cycle.
    pub fn call_soon(&self, callback: impl FnOnce() + 'static) -> Handle {
        self.schedule(None, Box::new(callback), CallContext::new())
    }

    pub fn call_soon_with_context(
        &self,
        callback: impl FnOnce() + 'static,
        context: CallContext,
    ) -> Handle {
        self.schedule(None, Box::new(callback), context)
    }

    /// Enqueues `callback` to run once `delay` has elapsed. A zero delay
    /// delegates to [`EventLoop::call_soon`].
    pub fn call_later(&self, delay: Duration, callback: impl FnOnce() + 'static) -> Handle {
        self.schedule(Some(delay), Box::new(callback), CallContext::new())
    }

    pub fn call_later_with_context(
        &self,
        delay: Duration,
        callback: impl FnOnce() + 'static,
        context: CallContext,
    ) -> Handle {
        self.schedule(Some(delay), Box::new(callback), context)
    }

    fn schedule(
        &self,
        delay: Option<Duration>,
        callback: Box<dyn FnOnce()>,
        context: CallContext,
    ) -> Handle {
        let when = match delay {
            None => None,
            Some(delay) if delay.is_zero() => None,
            Some(delay) => Some(self.inner.clock.now() + delay.as_secs_f64()),
        };
        if self.inner.debug {
            tracing::debug!(?when, ?context, "enqueueing callback");
        }
        let handle = Handle::new(when, callback, context);
        self.inner.scheduler.borrow_mut().enqueue(handle.clone());
        handle
    }

    /// Spawns a computation as a concurrently driven [`Task`].
    pub fn spawn<T, F>(&self, computation: F) -> Task<T>
    where
        T: 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        Task::spawn(self, computation)
    }

    /// The loop's [`Networking`] instance, created lazily and shared for the
    /// loop's lifetime.
    pub fn create_networking(&self) -> Rc<Networking> {
        let mut slot = self.inner.networking.borrow_mut();
        if let Some(networking) = &*slot {
            return networking.clone();
        }
        let networking = Rc::new(Networking::new(self.downgrade()));
        *slot = Some(networking.clone());
        networking
    }

    pub(crate) fn downgrade(&self) -> WeakEventLoop {
        WeakEventLoop {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn with_selector<R>(&self, f: impl FnOnce(&mut dyn Selector) -> R) -> R {
        f(&mut **self.inner.selector.borrow_mut())
    }

    /// Number of completed select phases. Callbacks dispatched within one
    /// step observe the same value, so it distinguishes "this step" from
    /// "a later step".
    pub fn steps(&self) -> u64 {
        self.inner.steps.get()
    }

    /// Number of handles currently held by the scheduler, cancelled ones
    /// included.
    pub fn pending_callbacks(&self) -> usize {
        self.inner.scheduler.borrow().len()
    }

    /// Runs one iteration: pop early timers, wait for I/O within the budget,
    /// dispatch early timers, I/O callbacks and late timers.
    ///
    /// # Errors
    ///
    /// [`Error::KeyboardInterrupt`] when an interrupt was delivered (the only
    /// error that crosses callback boundaries), or the selector's I/O
    /// failure.
    pub fn step(&self) -> Result<()> {
        self.check_interrupt()?;
        let inner = &*self.inner;

        let at_start = inner.clock.now();
        let resolution = inner.clock.resolution();
        let early = inner.scheduler.borrow_mut().pop_pending(at_start + resolution);

        let budget = if early.is_empty() {
            match inner.scheduler.borrow_mut().next_event() {
                // Nothing scheduled: sleep until I/O or a cross-thread wakeup.
                None => None,
                Some(at) => {
                    let now = inner.clock.now();
                    if at <= now {
                        Some(Duration::ZERO)
                    } else {
                        Some(Duration::from_secs_f64(at - now))
                    }
                }
            }
        } else {
            // Work is already due; just poll.
            Some(Duration::ZERO)
        };

        if inner.debug {
            tracing::debug!(early = early.len(), ?budget, "waiting for io");
        }
        let fired = inner.selector.borrow_mut().select(budget)?;
        self.check_interrupt()?;

        let after_select = inner.clock.now();
        inner.steps.set(inner.steps.get() + 1);
        if inner.debug {
            tracing::debug!(
                fired = fired.len(),
                elapsed = after_select - at_start,
                "io wait completed"
            );
        }

        // The late batch is captured before anything is dispatched, so work
        // scheduled by a callback always lands in a later step.
        let late = inner
            .scheduler
            .borrow_mut()
            .pop_pending(after_select + resolution);

        for handle in early {
            self.check_interrupt()?;
            self.invoke_handle(handle);
        }

        for event in fired {
            self.check_interrupt()?;
            let context = CallContext::new()
                .with("place", "io-callback")
                .with("fd", event.fd.to_string());
            let cb = event.cb;
            self.invoke_callback(Box::new(move || cb(event.fd, event.interest)), &context);
        }

        if inner.debug {
            tracing::debug!(late = late.len(), "invoking late callbacks");
        }
        for handle in late {
            self.check_interrupt()?;
            self.invoke_handle(handle);
        }

        Ok(())
    }

    /// Drives `computation` as the root task until it completes, and returns
    /// its outcome.
    ///
    /// While running, a SIGINT is converted at the next callback boundary
    /// into [`Error::KeyboardInterrupt`], which propagates out of here.
    ///
    /// # Errors
    ///
    /// The root task's stored failure, [`Error::KeyboardInterrupt`] on
    /// interrupt, or a selector I/O failure.
    pub fn run<T, F>(&self, computation: F) -> Result<Rc<T>>
    where
        T: 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        let root = self.spawn(computation);
        let _interrupt = InterruptGuard::install(self.inner.interrupted.clone(), self.wakeup())?;

        loop {
            self.step()?;
            if root.is_finished() {
                break;
            }
        }
        root.result()
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.inner.interrupted.swap(false, Ordering::SeqCst) {
            tracing::debug!("interrupt request arrived");
            return Err(Error::KeyboardInterrupt);
        }
        Ok(())
    }

    fn invoke_handle(&self, handle: Handle) {
        if handle.is_cancelled() {
            if self.inner.debug {
                tracing::debug!(?handle, "skipping cancelled handle");
            }
            return;
        }
        let Some(callback) = handle.take_callback() else {
            return;
        };
        let context = handle.context().clone();
        self.invoke_callback(callback, &context);
    }

    fn invoke_callback(&self, callback: Box<dyn FnOnce()>, context: &CallContext) {
        let _ambient = enter(self.clone());
        if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
            let failure = CallbackFailure {
                payload,
                context: context.clone(),
            };
            (self.inner.exception_handler)(&failure);
        }
    }
}

// === impl WeakEventLoop ===

impl WeakEventLoop {
    pub(crate) fn upgrade(&self) -> Option<EventLoop> {
        self.inner.upgrade().map(|inner| EventLoop { inner })
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("pending", &self.inner.scheduler.borrow().len())
            .field("steps", &self.inner.steps.get())
            .field("debug", &self.inner.debug)
            .finish()
    }
}

struct AmbientGuard {
    previous: Option<EventLoop>,
}

fn enter(event_loop: EventLoop) -> AmbientGuard {
    let previous = CURRENT.with(|slot| slot.borrow_mut().replace(event_loop));
    AmbientGuard { previous }
}

impl Drop for AmbientGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| *slot.borrow_mut() = previous);
    }
}

// === impl InterruptGuard ===

impl InterruptGuard {
    fn install(flag: Arc<AtomicBool>, wakeup: Wakeup) -> Result<Self> {
        // Safety: the handler only performs async-signal-safe work: an
        // atomic store and the wakeup of the default selector, which is a
        // single eventfd write.
        let id = unsafe {
            signal_hook::low_level::register(signal_hook::consts::SIGINT, move || {
                flag.store(true, Ordering::SeqCst);
                wakeup.wake();
            })
        }?;
        Ok(Self { id })
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.id);
    }
}
