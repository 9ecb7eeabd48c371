use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::utils::{CallOnDrop, lock};

/// A callback registered through one of the `subscribe` methods.
pub(crate) type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A registered listener.
///
/// The listener is removed as soon as this handle is dropped. Notifications that were already
/// queued for it may still be delivered after that.
#[must_use = "dropping a subscription unsubscribes the listener"]
#[derive(Debug)]
pub struct Subscription {
    _unsubscribe: CallOnDrop,
}

impl Subscription {
    pub(crate) fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            _unsubscribe: CallOnDrop::new(unsubscribe),
        }
    }
}

/// The listeners of a single entry.
pub(crate) struct Subscribers<T> {
    next_id: u64,
    listeners: BTreeMap<u64, Listener<T>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            listeners: BTreeMap::new(),
        }
    }
}

impl<T> Subscribers<T> {
    pub fn insert(&mut self, listener: Listener<T>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.insert(id, listener);
        id
    }

    pub fn remove(&mut self, id: u64) {
        self.listeners.remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Delivers notifications to listeners in the order they were queued.
///
/// Notifications are queued while the owning state is locked and delivered with no lock held
/// once [`drain`](Self::drain) is called. Only one thread drains at a time, so a listener is never
/// called concurrently with itself and never sees an older notification after a newer one. A
/// listener that triggers further notifications (for example by reading a cache) has them queued
/// and delivered after it returns.
pub(crate) struct Dispatcher<T> {
    state: Mutex<DispatchState<T>>,
}

struct DispatchState<T> {
    queue: VecDeque<(Listener<T>, T)>,
    draining: bool,
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(DispatchState {
                queue: VecDeque::new(),
                draining: false,
            }),
        }
    }
}

impl<T: Clone> Dispatcher<T> {
    /// Queues `value` for a single listener.
    pub fn enqueue(&self, listener: &Listener<T>, value: T) {
        lock(&self.state)
            .queue
            .push_back((Arc::clone(listener), value));
    }

    /// Queues `value` for every listener in `subscribers`.
    pub fn enqueue_all(&self, subscribers: &Subscribers<T>, value: &T) {
        if subscribers.is_empty() {
            return;
        }
        let mut state = lock(&self.state);
        for listener in subscribers.listeners.values() {
            state.queue.push_back((Arc::clone(listener), value.clone()));
        }
    }

    /// Delivers all queued notifications, unless another call is already doing so.
    pub fn drain(&self) {
        {
            let mut state = lock(&self.state);
            if state.draining {
                return;
            }
            state.draining = true;
        }

        let reset = DrainGuard(self);
        loop {
            let next = {
                let mut state = lock(&self.state);
                let next = state.queue.pop_front();
                // released together with observing the empty queue, so that a concurrent
                // `enqueue` either lands before this or drains by itself
                if next.is_none() {
                    state.draining = false;
                }
                next
            };
            match next {
                Some((listener, value)) => listener(&value),
                None => {
                    std::mem::forget(reset);
                    return;
                }
            }
        }
    }
}

/// Releases the drain token when a listener panics.
struct DrainGuard<'a, T>(&'a Dispatcher<T>);

impl<T> Drop for DrainGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = lock(&self.0.state);
        state.draining = false;
        state.queue.clear();
    }
}
