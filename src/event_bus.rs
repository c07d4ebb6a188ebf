//! Minimal async publish/subscribe primitives.
//!
//! [`UnaryEventBus`] holds a single listener set; [`EventBus`] keeps one
//! listener set per topic key. Dispatch invokes every listener synchronously,
//! in subscription order, before returning a [`Dispatch`] future that
//! completes once the asynchronous tails of all listeners have settled.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::warn;

type Listener<E> = Arc<dyn Fn(&E) -> Option<BoxFuture<'static, ()>> + Send + Sync>;

struct ListenerSet<E> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<E>)>>,
}

impl<E: 'static> ListenerSet<E> {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn add(self: &Arc<Self>, listener: Listener<E>) -> Subscription
    where
        E: Send + Sync,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener));

        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(set) = weak.upgrade() {
                    set.listeners.lock().retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }

    // Listeners may subscribe, unsubscribe or dispatch re-entrantly, so the
    // lock is released before any of them runs.
    fn dispatch(&self, event: &E) -> Dispatch {
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        let pending = snapshot
            .iter()
            .filter_map(|listener| listener(event))
            .collect();
        Dispatch { pending }
    }

    fn len(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Handle returned by `subscribe`.
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Removes the listener. A no-op if the bus is already gone.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

/// Outstanding asynchronous listener work from one dispatch.
///
/// Every listener has already been invoked by the time a `Dispatch` exists;
/// awaiting it waits for their async tails. Completion order between
/// listeners is unspecified.
#[derive(Default)]
pub struct Dispatch {
    pending: Vec<BoxFuture<'static, ()>>,
}

impl Dispatch {
    /// True when no listener returned asynchronous work.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of listeners still running asynchronously.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Appends the outstanding work of another dispatch.
    pub fn merge(mut self, other: Dispatch) -> Dispatch {
        self.pending.extend(other.pending);
        self
    }

    /// Hands any outstanding listener work to the current tokio runtime.
    ///
    /// Used by synchronous emitters (signal setters). Without a runtime the
    /// async tails cannot make progress and are dropped with a warning.
    pub fn detach(self) {
        if self.pending.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self);
            }
            Err(_) => {
                warn!(
                    listeners = self.pending.len(),
                    "No async runtime available; dropping asynchronous listener work"
                );
            }
        }
    }
}

impl Future for Dispatch {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.pending
            .retain_mut(|fut| fut.as_mut().poll(cx).is_pending());
        if self.pending.is_empty() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// Unkeyed event bus: one listener set.
///
/// # Examples
///
/// ```
/// use ferrous_services::UnaryEventBus;
/// use std::sync::{Arc, Mutex};
///
/// let bus = UnaryEventBus::<u32>::new();
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = seen.clone();
/// let sub = bus.subscribe(move |n: &u32| sink.lock().unwrap().push(*n));
///
/// let _ = bus.dispatch(&7);
/// sub.unsubscribe();
/// let _ = bus.dispatch(&8);
///
/// assert_eq!(*seen.lock().unwrap(), vec![7]);
/// ```
pub struct UnaryEventBus<E> {
    set: Arc<ListenerSet<E>>,
}

impl<E: Send + Sync + 'static> UnaryEventBus<E> {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self { set: Arc::new(ListenerSet::new()) }
    }

    /// Registers a synchronous listener.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.set.add(Arc::new(move |event: &E| -> Option<BoxFuture<'static, ()>> {
            listener(event);
            None
        }))
    }

    /// Registers a listener whose work continues asynchronously.
    pub fn subscribe_async<F, Fut>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.set
            .add(Arc::new(move |event: &E| -> Option<BoxFuture<'static, ()>> {
                Some(listener(event).boxed())
            }))
    }

    /// Invokes every listener with `event`.
    pub fn dispatch(&self, event: &E) -> Dispatch {
        self.set.dispatch(event)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.set.len()
    }
}

impl<E: Send + Sync + 'static> Default for UnaryEventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Keyed event bus: one listener set per topic.
pub struct EventBus<K, E> {
    topics: Mutex<HashMap<K, Arc<ListenerSet<E>>>>,
}

impl<K, E> EventBus<K, E>
where
    K: Eq + Hash + Clone,
    E: Send + Sync + 'static,
{
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self { topics: Mutex::new(HashMap::new()) }
    }

    fn topic(&self, key: K) -> Arc<ListenerSet<E>> {
        self.topics
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(ListenerSet::new()))
            .clone()
    }

    /// Registers a synchronous listener for `key`.
    pub fn subscribe<F>(&self, key: K, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.topic(key).add(Arc::new(move |event: &E| -> Option<BoxFuture<'static, ()>> {
            listener(event);
            None
        }))
    }

    /// Registers an asynchronous listener for `key`.
    pub fn subscribe_async<F, Fut>(&self, key: K, listener: F) -> Subscription
    where
        F: Fn(&E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.topic(key)
            .add(Arc::new(move |event: &E| -> Option<BoxFuture<'static, ()>> {
                Some(listener(event).boxed())
            }))
    }

    /// Invokes every listener registered for `key`.
    pub fn dispatch(&self, key: &K, event: &E) -> Dispatch {
        let set = self.topics.lock().get(key).cloned();
        match set {
            Some(set) => set.dispatch(event),
            None => Dispatch::default(),
        }
    }

    /// Number of listeners registered for `key`.
    pub fn listener_count(&self, key: &K) -> usize {
        self.topics.lock().get(key).map_or(0, |set| set.len())
    }
}

impl<K, E> Default for EventBus<K, E>
where
    K: Eq + Hash + Clone,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
