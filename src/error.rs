// Copyright 2025. The evloop Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::selector::Interest;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a promise or task was cancelled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelReason {
    message: Option<String>,
}

/// Errors produced and stored by the runtime.
///
/// The type is cheaply clonable (payloads are `Rc`-backed) because a stored
/// failure is re-raised to every awaiter of the promise that holds it.
#[derive(Debug, Clone)]
pub enum Error {
    /// Cooperative cancellation. Computations may catch this to run cleanup,
    /// then must re-raise or resolve.
    Cancelled(CancelReason),
    /// The interrupt-driven cancellation variant. This is the only error that
    /// propagates out of [`EventLoop::step`][crate::EventLoop::step] and
    /// [`EventLoop::run`][crate::EventLoop::run].
    KeyboardInterrupt,
    /// An invalid promise transition: double completion, or reading the
    /// result of a pending promise.
    InvalidState(&'static str),
    /// A networking operation was handed a socket in blocking mode.
    SocketMustBeNonBlocking,
    /// Two waiters contended for the same fd and direction.
    ConflictingWaiter { fd: RawFd, interest: Interest },
    /// A timeout fired before the guarded promise completed.
    Elapsed,
    /// No event loop is running on the current thread.
    NoRunningLoop,
    /// A promise was awaited outside of a task step.
    OutsideTask,
    Io(Rc<io::Error>),
    Other(Rc<dyn std::error::Error>),
}

// === impl CancelReason ===

impl CancelReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }

    pub fn unspecified() -> Self {
        Self { message: None }
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl From<Option<&str>> for CancelReason {
    fn from(message: Option<&str>) -> Self {
        Self {
            message: message.map(str::to_owned),
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "cancelled: {message}"),
            None => f.write_str("cancelled"),
        }
    }
}

// === impl Error ===

impl Error {
    /// Wraps an arbitrary error so it can be stored on a promise.
    pub fn other(err: impl std::error::Error + 'static) -> Self {
        Self::Other(Rc::new(err))
    }

    pub fn cancelled() -> Self {
        Self::Cancelled(CancelReason::unspecified())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Rc::new(err))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Cancelled(reason) => fmt::Display::fmt(reason, f),
            Error::KeyboardInterrupt => f.write_str("keyboard interrupt"),
            Error::InvalidState(what) => f.write_str(what),
            Error::SocketMustBeNonBlocking => f.write_str("socket must be in non-blocking mode"),
            Error::ConflictingWaiter { fd, interest } => {
                write!(f, "another waiter is already registered for fd {fd} ({interest:?})")
            }
            Error::Elapsed => f.write_str("deadline elapsed"),
            Error::NoRunningLoop => f.write_str("no event loop is running on this thread"),
            Error::OutsideTask => f.write_str("promise awaited outside of a task step"),
            Error::Io(err) => fmt::Display::fmt(err, f),
            Error::Other(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(&**err),
            Error::Other(err) => Some(&**err),
            _ => None,
        }
    }
}
