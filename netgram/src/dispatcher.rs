//! Thread-safe `tag -> callbacks` routing table plus a staging queue
//! drained one event per [`Dispatcher::tick`].
//!
//! Staging plus single-item drain decouples network-thread receive latency
//! from callback cost, and gives the embedder a natural place to throttle
//! delivery — the same reasoning `flux-network`'s connector applies by
//! handing raw `PollEvent`s to a caller-driven `poll_with` rather than
//! dispatching off the I/O thread directly.

use std::{
    collections::{HashMap, VecDeque},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::error;

use crate::message::Message;

/// Opaque handle returned by [`Dispatcher::register`], used to remove a
/// single callback later. Rust closures aren't comparable for equality the
/// way C#/Java delegates are, so identity is tracked by id instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type Callback = Arc<dyn Fn(&mut Message) + Send + Sync>;

struct Envelope {
    tag: u16,
    message: Message,
}

#[derive(Default)]
struct Inner {
    routes: HashMap<u16, Vec<(CallbackId, Callback)>>,
    queue: VecDeque<Envelope>,
}

/// Routes incoming messages to subscribers by tag.
pub struct Dispatcher {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()), next_id: AtomicU64::new(1) }
    }

    /// Registers `callback` for `tag`, creating the tag's callback list if
    /// absent. Returns an id usable with [`Dispatcher::unregister`].
    ///
    /// The callback receives `&mut Message` so it can drive the message's
    /// [`crate::buffer::Reader`] (decoding a payload advances the buffer's
    /// read cursor). Each callback gets its own independent clone of the
    /// staged message, so one subscriber reading the payload does not
    /// consume it for the next.
    pub fn register<F>(&self, tag: u16, callback: F) -> CallbackId
    where
        F: Fn(&mut Message) + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock().expect("dispatcher mutex poisoned");
        inner.routes.entry(tag).or_default().push((id, Arc::new(callback)));
        id
    }

    /// Removes a single callback from `tag`'s list. Returns `true` if a
    /// matching callback was found and removed.
    pub fn unregister(&self, tag: u16, id: CallbackId) -> bool {
        let mut inner = self.inner.lock().expect("dispatcher mutex poisoned");
        if let Some(callbacks) = inner.routes.get_mut(&tag) {
            let before = callbacks.len();
            callbacks.retain(|(cb_id, _)| *cb_id != id);
            return callbacks.len() != before;
        }
        false
    }

    /// Removes the entire callback list for `tag`.
    pub fn unregister_tag(&self, tag: u16) {
        let mut inner = self.inner.lock().expect("dispatcher mutex poisoned");
        inner.routes.remove(&tag);
    }

    /// Empties the routing table. Leaves the staging queue unaffected.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("dispatcher mutex poisoned");
        inner.routes.clear();
    }

    /// Enqueues `message` for delivery on a later [`Dispatcher::tick`].
    pub fn stage(&self, message: Message) {
        let mut inner = self.inner.lock().expect("dispatcher mutex poisoned");
        let tag = message.tag();
        inner.queue.push_back(Envelope { tag, message });
    }

    /// If the queue is non-empty, dequeues one event and invokes every
    /// callback registered for its tag, in registration order. A panicking
    /// callback is caught and logged; it does not prevent the remaining
    /// callbacks from running. Returns `true` if an event was delivered.
    pub fn tick(&self) -> bool {
        let (envelope, callbacks) = {
            let mut inner = self.inner.lock().expect("dispatcher mutex poisoned");
            let Some(envelope) = inner.queue.pop_front() else {
                return false;
            };
            let callbacks: Vec<Callback> = inner
                .routes
                .get(&envelope.tag)
                .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default();
            (envelope, callbacks)
        };

        for callback in callbacks {
            // Each callback gets its own clone so it can read the payload
            // from the start regardless of what earlier callbacks did with
            // their own reader cursor.
            let mut message = envelope.message.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(&mut message))).is_err() {
                error!(tag = envelope.tag, "dispatcher callback panicked, continuing");
            }
        }
        true
    }

    /// Number of events currently staged.
    pub fn queue_len(&self) -> usize {
        self.inner.lock().expect("dispatcher mutex poisoned").queue.len()
    }
}
