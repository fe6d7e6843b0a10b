//! Blocking FIFO queues and a one-shot slot.
//!
//! Every cross-thread handoff in a node goes through a [`MessageQueue`]:
//! readers push batches into the joiner's input, the node service pushes
//! decoded frames, fetch endpoints wake collectors. `push` never blocks and
//! `get` parks the caller until an item is available.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Unbounded multi-producer multi-consumer FIFO.
pub struct MessageQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Append `item` at the back and wake one waiter.
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Pop the front item, parking until one exists.
    pub fn get(&self) -> T {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            self.ready.wait(&mut items);
        }
    }

    /// Pop the front item if there is one.
    pub fn try_get(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A value published exactly once and observed by any number of waiters.
pub struct OneShot<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T: Clone> OneShot<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Publish `value`. Returns `false` and drops `value` if already set.
    pub fn set(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.ready.notify_all();
        true
    }

    /// Block until the value is published, then return a copy.
    pub fn wait(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.ready.wait(&mut slot);
        }
    }

    pub fn try_get(&self) -> Option<T> {
        self.slot.lock().clone()
    }
}

impl<T: Clone> Default for OneShot<T> {
    fn default() -> Self {
        Self::new()
    }
}
