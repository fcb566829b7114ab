//! Typed publish/subscribe bus with suppression and deferred dispatch.
//!
//! The subscriber table is keyed by the event's [`TypeKey`]. Each row keeps
//! its subscribers in insertion order together with an erased invoker that
//! downcasts the event back to its concrete type before calling the handler.
//!
//! `send` takes a snapshot of the row under the lock and dispatches outside
//! of it, so handlers may freely send, subscribe or unsubscribe while being
//! invoked. Nothing in this module logs while the table lock is held: the
//! launcher forwards log records through the bus, and a log call under the
//! lock would re-enter it.

use crate::error::{panic_message, EventError};
use crate::event::{downcast_event, Event};
use crate::hashing::{callback_key, method_key, type_key, CallbackKey, TypeKey};
use crate::ids::next_uid;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{error, trace, warn};

type Invoker = Arc<dyn Fn(&mut dyn Any) + Send + Sync>;
type PendingEvent = Box<dyn FnOnce(&EventBus) + Send>;

static GLOBAL_BUS: Lazy<Arc<EventBus>> = Lazy::new(|| Arc::new(EventBus::new()));

struct Subscriber {
    key: CallbackKey,
    invoker: Invoker,
}

/// A `(event type, callback)` pair identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub event: TypeKey,
    pub callback: CallbackKey,
}

/// The process event bus.
///
/// The host uses [`EventBus::global`]. Plugins never touch the global
/// directly: a plugin module carries its own copy of every static, so the
/// host hands the shared instance to each plugin through its
/// [`PluginContext`](crate::PluginContext).
pub struct EventBus {
    subscribers: Mutex<HashMap<TypeKey, Vec<Subscriber>>>,
    queue: Mutex<VecDeque<PendingEvent>>,
    suppression: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.subscribers.lock().len())
            .field("pending", &self.queue.lock().len())
            .field("suppression", &self.suppression.load(Ordering::SeqCst))
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            suppression: AtomicUsize::new(0),
        }
    }

    /// The bus shared by everything in the host process.
    pub fn global() -> Arc<EventBus> {
        GLOBAL_BUS.clone()
    }

    // ------------------------------------------------------------------
    // Subscription
    // ------------------------------------------------------------------

    /// Subscribes a closure. Every call yields a distinct key.
    pub fn subscribe<E, F>(&self, callback: F) -> CallbackKey
    where
        E: Event,
        F: Fn(&mut E) + Send + Sync + 'static,
    {
        let key = CallbackKey(type_key::<F>().0 ^ next_uid());
        self.insert::<E>(key, Self::invoker(callback));
        key
    }

    /// Subscribes a free function. Subscribing the same function twice
    /// replaces the first registration.
    pub fn subscribe_fn<E: Event>(&self, callback: fn(&mut E)) -> CallbackKey {
        let key = callback_key::<fn(&mut E)>(callback as usize);
        self.insert::<E>(key, Self::invoker(callback));
        key
    }

    /// Subscribes `method` bound to `instance`.
    ///
    /// Only a weak reference to the instance is kept. Once the instance is
    /// dropped the subscription stays in the table but does nothing.
    pub fn subscribe_method<E, T>(&self, instance: &Arc<T>, method: fn(&T, &mut E)) -> CallbackKey
    where
        E: Event,
        T: Send + Sync + 'static,
    {
        let key = method_key::<fn(&T, &mut E)>(
            Arc::as_ptr(instance) as *const () as usize,
            method as usize,
        );
        let weak = Arc::downgrade(instance);
        self.insert::<E>(
            key,
            Self::invoker(move |event: &mut E| {
                if let Some(target) = weak.upgrade() {
                    method(&target, event);
                }
            }),
        );
        key
    }

    /// Removes the subscription `key` for event type `E`.
    ///
    /// Unsubscribing a key that is not present is a caller bug and trips a
    /// debug assertion.
    pub fn unsubscribe<E: Event>(&self, key: CallbackKey) {
        let removed = self.remove(type_key::<E>(), key);
        debug_assert!(
            removed,
            "unsubscribe of unknown callback {} for {}",
            key,
            std::any::type_name::<E>()
        );
        if !removed {
            warn!(
                "Tried to unsubscribe unknown callback {} from {}",
                key,
                std::any::type_name::<E>()
            );
        }
    }

    /// Removes a subscription recorded as a [`Subscription`]. Returns whether
    /// anything was removed.
    pub fn remove_subscription(&self, subscription: Subscription) -> bool {
        self.remove(subscription.event, subscription.callback)
    }

    /// Drops every subscriber.
    pub fn clear_all(&self) {
        let cleared = {
            let mut subscribers = self.subscribers.lock();
            let count = subscribers.values().map(Vec::len).sum::<usize>();
            subscribers.clear();
            count
        };
        trace!("Cleared {} subscribers from event bus", cleared);
    }

    /// Number of subscribers currently registered for `E`.
    pub fn subscriber_count<E: Event>(&self) -> usize {
        self.subscribers
            .lock()
            .get(&type_key::<E>())
            .map_or(0, Vec::len)
    }

    /// Number of subscribers across all event types.
    pub fn total_subscribers(&self) -> usize {
        self.subscribers.lock().values().map(Vec::len).sum()
    }

    pub fn is_subscribed<E: Event>(&self, key: CallbackKey) -> bool {
        self.subscribers
            .lock()
            .get(&type_key::<E>())
            .is_some_and(|row| row.iter().any(|s| s.key == key))
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Dispatches `event` synchronously and returns its final handled flag.
    ///
    /// Returns `false` without calling anyone while a suppressor is alive.
    /// Every subscriber in the snapshot runs even after one marks the event
    /// handled. A panicking subscriber is logged and skipped; the remaining
    /// ones still run and the send reports `false`.
    pub fn send<E: Event>(&self, event: &mut E) -> bool {
        let snapshot: Vec<(CallbackKey, Invoker)> = {
            let subscribers = self.subscribers.lock();
            match subscribers.get(&type_key::<E>()) {
                Some(row) => row.iter().map(|s| (s.key, s.invoker.clone())).collect(),
                None => Vec::new(),
            }
        };

        if self.is_suppressed() {
            trace!("Suppressed {}", event.event_name());
            return false;
        }

        let mut failed = false;
        for (key, invoker) in snapshot {
            let erased: &mut dyn Any = &mut *event;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| invoker(erased))) {
                failed = true;
                let err = EventError::HandlerPanicked {
                    event: event.event_name(),
                    message: panic_message(payload.as_ref()),
                };
                error!(callback = %key, "{}", err);
            }
        }

        !failed && event.is_handled()
    }

    /// Queues `event` for the next [`process`](Self::process) call.
    ///
    /// Suppression is checked when the event is dispatched, not here.
    pub fn post<E: Event>(&self, event: E) -> PostedEvent {
        let (sender, receiver) = oneshot::channel();
        let mut event = event;
        let pending: PendingEvent = Box::new(move |bus: &EventBus| {
            let handled = bus.send(&mut event);
            // The poster may have dropped its future; that is fine.
            let _ = sender.send(handled);
        });
        self.queue.lock().push_back(pending);
        PostedEvent { receiver }
    }

    /// Dispatches everything posted before this call, in FIFO order.
    ///
    /// Events posted while processing are left for the next call. Returns
    /// the number of events dispatched.
    pub fn process(&self) -> usize {
        let pending = std::mem::take(&mut *self.queue.lock());
        let count = pending.len();
        for dispatch in pending {
            dispatch(self);
        }
        count
    }

    /// Number of posted events waiting for `process`.
    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Starts a suppression scope on this bus.
    pub fn suppress(&self) -> EventSuppressor<'_> {
        EventSuppressor::new(self)
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppression.load(Ordering::SeqCst) > 0
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn invoker<E: Event>(callback: impl Fn(&mut E) + Send + Sync + 'static) -> Invoker {
        Arc::new(move |event: &mut dyn Any| {
            if let Some(event) = downcast_event::<E>(event) {
                callback(event);
            }
        })
    }

    fn insert<E: Event>(&self, key: CallbackKey, invoker: Invoker) {
        let replaced = {
            let mut subscribers = self.subscribers.lock();
            let row = subscribers.entry(type_key::<E>()).or_default();
            match row.iter_mut().find(|s| s.key == key) {
                Some(existing) => {
                    existing.invoker = invoker;
                    true
                }
                None => {
                    row.push(Subscriber { key, invoker });
                    false
                }
            }
        };
        trace!(
            "Subscribed {} to {}{}",
            key,
            std::any::type_name::<E>(),
            if replaced { " (replaced)" } else { "" }
        );
    }

    fn remove(&self, event: TypeKey, key: CallbackKey) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(row) = subscribers.get_mut(&event) else {
            return false;
        };
        let before = row.len();
        row.retain(|s| s.key != key);
        let removed = row.len() != before;
        if row.is_empty() {
            subscribers.remove(&event);
        }
        removed
    }
}

/// RAII scope during which `send` on the bus is a no-op returning `false`.
///
/// Scopes nest; the bus is unsuppressed once the last one is dropped.
pub struct EventSuppressor<'a> {
    bus: &'a EventBus,
}

impl<'a> EventSuppressor<'a> {
    pub fn new(bus: &'a EventBus) -> Self {
        bus.suppression.fetch_add(1, Ordering::SeqCst);
        Self { bus }
    }
}

impl Drop for EventSuppressor<'_> {
    fn drop(&mut self) {
        self.bus.suppression.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolves with the handled flag once a posted event has been dispatched.
#[derive(Debug)]
pub struct PostedEvent {
    receiver: oneshot::Receiver<bool>,
}

impl PostedEvent {
    /// Returns the result if the event has been dispatched already.
    pub fn try_result(&mut self) -> Result<Option<bool>, EventError> {
        match self.receiver.try_recv() {
            Ok(handled) => Ok(Some(handled)),
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => Err(EventError::Discarded),
        }
    }

    /// Blocks the current thread until the event is dispatched.
    ///
    /// Must not be called from the thread that drives `process`.
    pub fn wait(self) -> Result<bool, EventError> {
        futures::executor::block_on(self)
    }
}

impl Future for PostedEvent {
    type Output = Result<bool, EventError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(handled)) => Poll::Ready(Ok(handled)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(EventError::Discarded)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{define_event, define_request, Request};
    use std::sync::atomic::AtomicU32;

    define_event! {
        pub struct Tick { pub t: u32 }
    }

    define_event! {
        pub struct Ping {}
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Position {
        pub x: i32,
        pub y: i32,
    }

    define_request! {
        pub struct WhereIsMouse -> Position {}
    }

    fn labelled(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> impl Fn(&mut Ping) + Send + Sync {
        let log = log.clone();
        move |_: &mut Ping| log.lock().push(label)
    }

    #[test]
    fn test_dispatch_with_suppression() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |tick: &mut Tick| sink.lock().push(tick.t));

        {
            let _suppressor = EventSuppressor::new(&bus);
            assert!(!bus.send(&mut Tick::new(1)));
            assert!(seen.lock().is_empty());
        }

        assert!(!bus.send(&mut Tick::new(2)));
        assert_eq!(*seen.lock(), vec![2]);
    }

    #[test]
    fn test_nested_suppressors() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        bus.subscribe(move |_: &mut Ping| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let outer = bus.suppress();
        {
            let _inner = bus.suppress();
            bus.send(&mut Ping::new());
        }
        bus.send(&mut Ping::new());
        drop(outer);
        bus.send(&mut Ping::new());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscribe_unsubscribe_round_trip() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let h1 = bus.subscribe::<Ping, _>(labelled(&log, "h1"));
        let _h2 = bus.subscribe::<Ping, _>(labelled(&log, "h2"));

        bus.send(&mut Ping::new());
        assert_eq!(*log.lock(), vec!["h1", "h2"]);

        bus.unsubscribe::<Ping>(h1);
        log.lock().clear();
        bus.send(&mut Ping::new());
        assert_eq!(*log.lock(), vec!["h2"]);
    }

    #[test]
    fn test_unsubscribe_restores_empty_table() {
        let bus = EventBus::new();
        let key = bus.subscribe(|_: &mut Tick| {});
        assert_eq!(bus.subscriber_count::<Tick>(), 1);
        assert!(bus.is_subscribed::<Tick>(key));

        bus.unsubscribe::<Tick>(key);
        assert_eq!(bus.subscriber_count::<Tick>(), 0);
        assert_eq!(bus.total_subscribers(), 0);
        assert!(bus.subscribers.lock().is_empty());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unsubscribe of unknown callback")]
    fn test_unsubscribe_unknown_key_asserts() {
        let bus = EventBus::new();
        bus.unsubscribe::<Tick>(CallbackKey(42));
    }

    #[test]
    fn test_request_response() {
        let bus = EventBus::new();
        bus.subscribe(|request: &mut WhereIsMouse| {
            request.set_result(Position { x: 12, y: 34 });
            request.handled = true;
        });

        let mut request = WhereIsMouse::new();
        assert!(bus.send(&mut request));
        assert_eq!(request.result, Some(Position { x: 12, y: 34 }));
    }

    #[test]
    fn test_handled_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicU32::new(0));

        let first = calls.clone();
        bus.subscribe(move |ping: &mut Ping| {
            first.fetch_add(1, Ordering::SeqCst);
            ping.handled = true;
        });
        let second = calls.clone();
        bus.subscribe(move |ping: &mut Ping| {
            assert!(ping.handled);
            second.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.send(&mut Ping::new()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicU32::new(0));

        bus.subscribe(|ping: &mut Ping| {
            ping.handled = true;
            panic!("handler failure");
        });
        let counter = reached.clone();
        bus.subscribe(move |_: &mut Ping| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!bus.send(&mut Ping::new()));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    fn count_tick(tick: &mut Tick) {
        tick.t += 1;
    }

    #[test]
    fn test_function_resubscribe_is_idempotent() {
        let bus = EventBus::new();
        let first = bus.subscribe_fn(count_tick);
        let second = bus.subscribe_fn(count_tick);
        assert_eq!(first, second);
        assert_eq!(bus.subscriber_count::<Tick>(), 1);

        let mut tick = Tick::new(0);
        bus.send(&mut tick);
        assert_eq!(tick.t, 1);
    }

    struct Counter {
        hits: AtomicU32,
    }

    impl Counter {
        fn on_ping(&self, _: &mut Ping) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }

        fn on_ping_twice(&self, _: &mut Ping) {
            self.hits.fetch_add(2, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_method_subscription() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter { hits: AtomicU32::new(0) });

        let once = bus.subscribe_method(&counter, Counter::on_ping);
        let twice = bus.subscribe_method(&counter, Counter::on_ping_twice);
        assert_ne!(once, twice);
        assert_eq!(once, bus.subscribe_method(&counter, Counter::on_ping));

        bus.send(&mut Ping::new());
        assert_eq!(counter.hits.load(Ordering::SeqCst), 3);

        bus.unsubscribe::<Ping>(twice);
        bus.send(&mut Ping::new());
        assert_eq!(counter.hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_method_subscription_with_dropped_instance() {
        let bus = EventBus::new();
        let counter = Arc::new(Counter { hits: AtomicU32::new(0) });
        bus.subscribe_method(&counter, Counter::on_ping);
        drop(counter);

        assert!(!bus.send(&mut Ping::new()));
    }

    #[test]
    fn test_subscribe_during_send_affects_next_send_only() {
        let bus = Arc::new(EventBus::new());
        let late_calls = Arc::new(AtomicU32::new(0));

        let inner_bus = Arc::downgrade(&bus);
        let late = late_calls.clone();
        bus.subscribe(move |_: &mut Ping| {
            if let Some(bus) = inner_bus.upgrade() {
                let late = late.clone();
                bus.subscribe(move |_: &mut Ping| {
                    late.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        bus.send(&mut Ping::new());
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);

        bus.send(&mut Ping::new());
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_send() {
        let bus = Arc::new(EventBus::new());
        let ticks = Arc::new(AtomicU32::new(0));

        let weak = Arc::downgrade(&bus);
        bus.subscribe(move |_: &mut Ping| {
            if let Some(bus) = weak.upgrade() {
                bus.send(&mut Tick::new(5));
            }
        });
        let seen = ticks.clone();
        bus.subscribe(move |tick: &mut Tick| {
            seen.store(tick.t, Ordering::SeqCst);
        });

        bus.send(&mut Ping::new());
        assert_eq!(ticks.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_post_is_fifo_and_deferred() {
        let bus = Arc::new(EventBus::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let sink = order.clone();
        let weak = Arc::downgrade(&bus);
        bus.subscribe(move |tick: &mut Tick| {
            sink.lock().push(tick.t);
            if tick.t == 1 {
                if let Some(bus) = weak.upgrade() {
                    bus.post(Tick::new(99));
                }
            }
        });

        bus.post(Tick::new(1));
        bus.post(Tick::new(2));
        bus.post(Tick::new(3));
        assert!(order.lock().is_empty());
        assert_eq!(bus.pending_count(), 3);

        assert_eq!(bus.process(), 3);
        assert_eq!(*order.lock(), vec![1, 2, 3]);

        assert_eq!(bus.process(), 1);
        assert_eq!(*order.lock(), vec![1, 2, 3, 99]);
    }

    #[test]
    fn test_posted_event_reports_handled() {
        let bus = EventBus::new();
        bus.subscribe(|ping: &mut Ping| ping.handled = true);

        let mut posted = bus.post(Ping::new());
        assert_eq!(posted.try_result().unwrap(), None);

        bus.process();
        assert_eq!(posted.try_result().unwrap(), Some(true));
    }

    #[test]
    fn test_suppressor_created_during_send() {
        let bus: &'static EventBus = Box::leak(Box::new(EventBus::new()));
        let held: Arc<Mutex<Option<EventSuppressor<'static>>>> = Arc::new(Mutex::new(None));
        let second_ran = Arc::new(AtomicU32::new(0));

        let slot = held.clone();
        bus.subscribe(move |_: &mut Ping| {
            slot.lock().get_or_insert_with(|| bus.suppress());
        });
        let counter = second_ran.clone();
        bus.subscribe(move |ping: &mut Ping| {
            counter.fetch_add(1, Ordering::SeqCst);
            ping.handled = true;
        });

        // The send already under way finishes with every subscriber
        assert!(bus.send(&mut Ping::new()));
        assert_eq!(second_ran.load(Ordering::SeqCst), 1);
        assert!(bus.is_suppressed());

        assert!(!bus.send(&mut Ping::new()));
        assert_eq!(second_ran.load(Ordering::SeqCst), 1);

        held.lock().take();
        assert!(!bus.is_suppressed());
        assert!(bus.send(&mut Ping::new()));
        assert_eq!(second_ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_global_is_one_instance() {
        let first = EventBus::global();
        let second = EventBus::global();
        assert!(Arc::ptr_eq(&first, &second));

        let from_thread = std::thread::spawn(EventBus::global).join().unwrap();
        assert!(Arc::ptr_eq(&first, &from_thread));
    }

    #[test]
    fn test_suppression_checked_at_dispatch() {
        let bus = EventBus::new();
        bus.subscribe(|ping: &mut Ping| ping.handled = true);

        let posted_early = {
            let _suppressor = bus.suppress();
            bus.post(Ping::new())
        };
        bus.process();
        assert!(posted_early.wait().unwrap());

        let dispatched_suppressed = {
            let _suppressor = bus.suppress();
            let posted = bus.post(Ping::new());
            bus.process();
            posted
        };
        assert!(!dispatched_suppressed.wait().unwrap());
    }

    #[tokio::test]
    async fn test_posted_event_future_across_threads() {
        let bus = Arc::new(EventBus::new());
        bus.subscribe(|ping: &mut Ping| ping.handled = true);

        let posted = bus.post(Ping::new());
        let processor = bus.clone();
        std::thread::spawn(move || processor.process()).join().unwrap();

        assert!(posted.await.unwrap());
    }

    #[test]
    fn test_discarded_post_reports_error() {
        let bus = EventBus::new();
        let mut posted = bus.post(Ping::new());
        drop(bus);
        assert!(matches!(posted.try_result(), Err(EventError::Discarded)));
    }

    #[test]
    fn test_clear_all() {
        let bus = EventBus::new();
        bus.subscribe(|_: &mut Ping| {});
        bus.subscribe(|_: &mut Tick| {});
        assert_eq!(bus.total_subscribers(), 2);

        bus.clear_all();
        assert_eq!(bus.total_subscribers(), 0);
        assert!(!bus.send(&mut Ping::new()));
    }
}
