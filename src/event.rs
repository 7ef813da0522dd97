//! A small synchronous broadcast-event bus.
//!
//! The original C implementation this crate is modeled on represents an
//! event as an ordered list of `(receiver, handler, id)` triples invoked
//! through untyped `void *` callbacks. Here an [`Event<A>`] is a typed
//! broadcast channel: `register` takes any `FnMut(&A)` closure and returns
//! a [`SubscriptionId`] that `unregister` later consumes. There is no
//! cross-thread raising — the worker pool funnels its results back onto
//! the main thread via the reactor's self-pipe instead of raising events
//! from a worker thread (see [`crate::worker`]).

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque handle returned by [`Event::register`], used to `unregister` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

fn next_subscription_id() -> SubscriptionId {
    SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed))
}

struct Subscription<A: ?Sized> {
    id: SubscriptionId,
    removed: Cell<bool>,
    handler: RefCell<Box<dyn FnMut(&A)>>,
}

/// A broadcast event carrying arguments of type `A`.
///
/// Registration and unregistration are safe to call from within a handler
/// that is itself running as part of dispatch: new registrations are only
/// visible to the *next* `raise`, and unregistering a subscription that
/// hasn't run yet in the current `raise` skips it for the remainder of
/// that raise.
pub struct Event<A: ?Sized> {
    subs: RefCell<Vec<Rc<Subscription<A>>>>,
}

impl<A: ?Sized> Default for Event<A> {
    fn default() -> Self {
        Self { subs: RefCell::new(Vec::new()) }
    }
}

impl<A: ?Sized> Event<A> {
    /// Create an event with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, invoked on every subsequent `raise`.
    pub fn register(&self, handler: impl FnMut(&A) + 'static) -> SubscriptionId {
        let id = next_subscription_id();
        self.subs.borrow_mut().push(Rc::new(Subscription {
            id,
            removed: Cell::new(false),
            handler: RefCell::new(Box::new(handler)),
        }));
        id
    }

    /// Remove a previously registered handler. A no-op if already removed.
    pub fn unregister(&self, id: SubscriptionId) {
        let mut subs = self.subs.borrow_mut();
        if let Some(pos) = subs.iter().position(|s| s.id == id) {
            subs[pos].removed.set(true);
            subs.remove(pos);
        }
    }

    /// Number of currently registered handlers.
    pub fn subscriber_count(&self) -> usize {
        self.subs.borrow().len()
    }

    /// Invoke every live handler, in registration order, with `args`.
    ///
    /// Handlers run synchronously on the calling thread. A snapshot of the
    /// subscriber list is taken before dispatch begins, so handlers that
    /// register or unregister other handlers mid-dispatch cannot corrupt
    /// the in-progress iteration.
    pub fn raise(&self, args: &A) {
        let snapshot: Vec<Rc<Subscription<A>>> = self.subs.borrow().clone();
        for sub in snapshot {
            if sub.removed.get() {
                continue;
            }
            let mut handler = sub.handler.borrow_mut();
            (handler)(args);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn raises_in_registration_order() {
        let ev: Event<i32> = Event::new();
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let l1 = log.clone();
        let l2 = log.clone();
        ev.register(move |v| l1.borrow_mut().push(("a", *v)));
        ev.register(move |v| l2.borrow_mut().push(("b", *v)));
        ev.raise(&7);
        assert_eq!(*log.borrow(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn unregister_stops_future_raises() {
        let ev: Event<()> = Event::new();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let id = ev.register(move |_| c.set(c.get() + 1));
        ev.raise(&());
        ev.unregister(id);
        ev.raise(&());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn handler_can_unregister_itself_mid_raise() {
        let ev: Rc<Event<()>> = Rc::new(Event::new());
        let count = Rc::new(Cell::new(0));
        let id_cell: Rc<RefCell<Option<SubscriptionId>>> = Rc::new(RefCell::new(None));

        let ev2 = ev.clone();
        let count2 = count.clone();
        let id_cell2 = id_cell.clone();
        let id = ev.register(move |_| {
            count2.set(count2.get() + 1);
            if let Some(id) = *id_cell2.borrow() {
                ev2.unregister(id);
            }
        });
        *id_cell.borrow_mut() = Some(id);

        ev.raise(&());
        ev.raise(&());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn registering_during_raise_applies_next_time() {
        let ev: Rc<Event<()>> = Rc::new(Event::new());
        let count = Rc::new(Cell::new(0));

        let ev2 = ev.clone();
        let count2 = count.clone();
        ev.register(move |_| {
            let count3 = count2.clone();
            ev2.register(move |_| count3.set(count3.get() + 1));
        });

        ev.raise(&());
        assert_eq!(count.get(), 0, "late registration must not fire in the same raise");
        ev.raise(&());
        assert_eq!(count.get(), 1);
    }
}
