// Copyright 2025. The evloop Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::fmt;
use std::rc::Rc;

type Callback = Box<dyn FnOnce()>;

/// Immutable key/value context attached to a scheduled callback.
///
/// Carried through to exception reports and scheduling traces so that user
/// code can be identified in logs.
#[derive(Clone, Default)]
pub struct CallContext {
    entries: Rc<BTreeMap<String, String>>,
}

/// A deferred-callback record.
///
/// Handles are cheap clonable references; cancelling any clone cancels the
/// record. A handle's callback is taken at dispatch, so it is invoked at most
/// once, and never after [`Handle::cancel`].
#[derive(Clone)]
pub struct Handle {
    inner: Rc<HandleInner>,
}

struct HandleInner {
    /// Absolute deadline in clock seconds. `None` means "next cycle".
    when: Option<f64>,
    callback: RefCell<Option<Callback>>,
    cancelled: Cell<bool>,
    context: CallContext,
}

/// Deadline-ordered queue of [`Handle`]s.
///
/// Entries are keyed by `(deadline, seq)` where `seq` is a monotonically
/// increasing insertion tiebreaker, so equal-deadline handles dispatch in
/// insertion order. Handles without a deadline sort before everything else.
pub struct Scheduler {
    heap: BinaryHeap<Entry>,
    seq: u64,
}

struct Entry {
    key: f64,
    seq: u64,
    handle: Handle,
}

// === impl CallContext ===

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Rc::make_mut(&mut self.entries).insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

// === impl Handle ===

impl Handle {
    pub(crate) fn new(when: Option<f64>, callback: Callback, context: CallContext) -> Self {
        Self {
            inner: Rc::new(HandleInner {
                when,
                callback: RefCell::new(Some(callback)),
                cancelled: Cell::new(false),
                context,
            }),
        }
    }

    /// Marks the record so it is dropped at dispatch instead of invoked.
    pub fn cancel(&self) {
        self.inner.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// The absolute deadline in clock seconds, if any.
    pub fn when(&self) -> Option<f64> {
        self.inner.when
    }

    pub(crate) fn context(&self) -> &CallContext {
        &self.inner.context
    }

    pub(crate) fn take_callback(&self) -> Option<Callback> {
        self.inner.callback.borrow_mut().take()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("when", &self.inner.when)
            .field("cancelled", &self.inner.cancelled.get())
            .field("context", &self.inner.context)
            .finish_non_exhaustive()
    }
}

// === impl Entry ===

impl Entry {
    fn cmp_key(&self, other: &Self) -> Ordering {
        self.key
            .total_cmp(&other.key)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_key(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse to pop the earliest entry first.
        other.cmp_key(self)
    }
}

// === impl Scheduler ===

impl Scheduler {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn enqueue(&mut self, handle: Handle) {
        let key = handle.when().unwrap_or(f64::NEG_INFINITY);
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Entry { key, seq, handle });
    }

    /// Removes and returns every pending handle whose deadline is at or
    /// before `up_to`, in `(deadline, seq)` order. Cancelled entries are
    /// dropped silently.
    pub fn pop_pending(&mut self, up_to: f64) -> Vec<Handle> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.key > up_to {
                break;
            }
            let Some(entry) = self.heap.pop() else { break };
            if !entry.handle.is_cancelled() {
                due.push(entry.handle);
            }
        }
        due
    }

    /// The deadline of the earliest pending entry, discarding cancelled
    /// entries from the top of the queue.
    pub fn next_event(&mut self) -> Option<f64> {
        while let Some(top) = self.heap.peek() {
            if top.handle.is_cancelled() {
                self.heap.pop();
            } else {
                return Some(top.key);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("len", &self.heap.len())
            .field("seq", &self.seq)
            .finish()
    }
}
