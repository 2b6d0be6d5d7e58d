// Copyright 2025. The evloop Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;

use crate::error::Result;

bitflags::bitflags! {
    /// Readiness directions a watch can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// Callback invoked with the fd and the directions that fired.
pub type EventCallback = Rc<dyn Fn(RawFd, Interest)>;

/// One fired (fd, direction) pairing returned by [`Selector::select`].
#[derive(Clone)]
pub struct Fired {
    pub cb: EventCallback,
    pub fd: RawFd,
    pub interest: Interest,
}

/// Cross-thread handle that interrupts a blocked [`Selector::select`].
///
/// This is the only operation of the runtime that may be called from another
/// thread. The wake function must stay async-signal-safe; the default
/// backend's is a single eventfd write.
#[derive(Clone)]
pub struct Wakeup {
    wake: Arc<dyn Fn() + Send + Sync>,
}

/// Multiplexes fd readiness for the event loop.
///
/// A given (fd, direction) holds at most one callback; registering it again
/// replaces the callback. `select` never invokes callbacks itself, it only
/// reports them so the loop can dispatch inside its ambient context.
pub trait Selector {
    /// Registers interest in `interest` directions of `fd`.
    fn add_watch(&mut self, fd: RawFd, interest: Interest, cb: EventCallback) -> Result<()>;

    /// Removes registrations for `fd`.
    ///
    /// With `interest = None` every direction is removed, otherwise only the
    /// given bits. If `cb` is supplied, a direction is only cleared when it
    /// currently holds that exact callback.
    fn stop_watch(
        &mut self,
        fd: RawFd,
        interest: Option<Interest>,
        cb: Option<&EventCallback>,
    ) -> Result<()>;

    /// Blocks up to `timeout` (`None` blocks indefinitely, zero polls) and
    /// returns the watches that fired, one entry per (fd, direction).
    fn select(&mut self, timeout: Option<Duration>) -> Result<Vec<Fired>>;

    /// Returns a cross-thread wakeup handle for this selector.
    fn wakeup(&self) -> Wakeup;

    /// Drops every registration. OS resources are released on drop.
    fn finalize(&mut self) -> Result<()>;
}

/// The default backend over the platform poller.
pub struct PollSelector {
    poll: mio::Poll,
    events: mio::Events,
    waker: Arc<mio::Waker>,
    watches: HashMap<RawFd, Watch>,
}

#[derive(Default)]
struct Watch {
    read: Option<EventCallback>,
    write: Option<EventCallback>,
}

const WAKER_TOKEN: mio::Token = mio::Token(usize::MAX);

// === impl Wakeup ===

impl Wakeup {
    pub fn new(wake: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            wake: Arc::new(wake),
        }
    }

    pub fn wake(&self) {
        (self.wake)();
    }
}

impl fmt::Debug for Wakeup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wakeup").finish_non_exhaustive()
    }
}

// === impl Watch ===

impl Watch {
    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    fn interests(&self) -> Option<mio::Interest> {
        match (&self.read, &self.write) {
            (Some(_), Some(_)) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (Some(_), None) => Some(mio::Interest::READABLE),
            (None, Some(_)) => Some(mio::Interest::WRITABLE),
            (None, None) => None,
        }
    }

    fn slot(&mut self, direction: Interest) -> &mut Option<EventCallback> {
        if direction == Interest::READABLE {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

// === impl PollSelector ===

impl PollSelector {
    pub fn new() -> Result<Self> {
        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: mio::Events::with_capacity(1024),
            waker,
            watches: HashMap::new(),
        })
    }

    fn update_registration(&mut self, fd: RawFd, known: bool) -> io::Result<()> {
        let mut source = SourceFd(&fd);
        let token = mio::Token(fd as usize);
        match self.watches.get(&fd).and_then(Watch::interests) {
            Some(interests) if known => {
                self.poll.registry().reregister(&mut source, token, interests)
            }
            Some(interests) => self.poll.registry().register(&mut source, token, interests),
            None => {
                self.watches.remove(&fd);
                self.poll.registry().deregister(&mut source)
            }
        }
    }

    fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut remaining = timeout;
        loop {
            match self.poll.poll(&mut self.events, remaining) {
                Ok(()) => return Ok(true),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    // Retry within the remaining budget. The loop re-checks
                    // its interrupt flag once select returns.
                    if let Some(deadline) = deadline {
                        let now = Instant::now();
                        if now >= deadline {
                            return Ok(false);
                        }
                        remaining = Some(deadline - now);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Selector for PollSelector {
    fn add_watch(&mut self, fd: RawFd, interest: Interest, cb: EventCallback) -> Result<()> {
        let known = self.watches.contains_key(&fd);
        let watch = self.watches.entry(fd).or_default();
        if interest.contains(Interest::READABLE) {
            watch.read = Some(cb.clone());
        }
        if interest.contains(Interest::WRITABLE) {
            watch.write = Some(cb.clone());
        }
        tracing::trace!(fd, ?interest, "watch added");
        self.update_registration(fd, known)?;
        Ok(())
    }

    fn stop_watch(
        &mut self,
        fd: RawFd,
        interest: Option<Interest>,
        cb: Option<&EventCallback>,
    ) -> Result<()> {
        let Some(watch) = self.watches.get_mut(&fd) else {
            return Ok(());
        };

        let cleared = interest.unwrap_or(Interest::all());
        for direction in [Interest::READABLE, Interest::WRITABLE] {
            if !cleared.contains(direction) {
                continue;
            }
            let slot = watch.slot(direction);
            let matches = match (cb, &slot) {
                (Some(expected), Some(current)) => Rc::ptr_eq(expected, current),
                (None, _) => true,
                (Some(_), None) => false,
            };
            if matches {
                *slot = None;
            }
        }
        tracing::trace!(fd, ?interest, "watch stopped");
        self.update_registration(fd, true)?;
        Ok(())
    }

    fn select(&mut self, timeout: Option<Duration>) -> Result<Vec<Fired>> {
        if !self.poll_once(timeout)? {
            // The budget expired while retrying an interrupted poll.
            return Ok(Vec::new());
        }

        let mut fired = Vec::new();
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let fd = event.token().0 as RawFd;
            // Readiness for fds the poller no longer knows is dropped.
            let Some(watch) = self.watches.get(&fd) else {
                continue;
            };
            // Error and hang-up conditions fan into every registered
            // direction so the owning operation can observe the failure.
            let broken = event.is_error();
            if event.is_readable() || event.is_read_closed() || broken {
                if let Some(cb) = &watch.read {
                    fired.push(Fired {
                        cb: cb.clone(),
                        fd,
                        interest: Interest::READABLE,
                    });
                }
            }
            if event.is_writable() || event.is_write_closed() || broken {
                if let Some(cb) = &watch.write {
                    fired.push(Fired {
                        cb: cb.clone(),
                        fd,
                        interest: Interest::WRITABLE,
                    });
                }
            }
        }
        Ok(fired)
    }

    fn wakeup(&self) -> Wakeup {
        let waker = self.waker.clone();
        // Errors are swallowed: the handle may be invoked from a signal
        // handler, where nothing useful can be done with them anyway.
        Wakeup::new(move || {
            let _ = waker.wake();
        })
    }

    fn finalize(&mut self) -> Result<()> {
        let fds: Vec<_> = self.watches.keys().copied().collect();
        for fd in fds {
            self.watches.remove(&fd);
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        Ok(())
    }
}

impl fmt::Debug for PollSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollSelector")
            .field("watches", &self.watches.len())
            .finish_non_exhaustive()
    }
}
