//! Named-event subscription bus.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Names of the events an endpoint or server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The connection opened (server: a connection was accepted).
    Open,
    /// The connection closed.
    Close,
    /// A protocol, transport, or callback error was raised.
    Error,
    /// A valid envelope was received.
    Message,
    /// Bytes were handed to the transport.
    Send,
    /// A connection owned by a server raised an error.
    ConnectionError,
}

/// Events that can be dispatched through an [`EventBus`].
pub trait BusEvent: Send + Sync + 'static {
    /// Name subscribers register against.
    fn kind(&self) -> EventKind;
}

/// Opaque handle returned by [`EventBus::on`] and accepted by [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Subscriber callback.
pub type Callback<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

struct Subscriptions<E> {
    next_token: u64,
    by_kind: HashMap<EventKind, Vec<(SubscriptionToken, Callback<E>)>>,
    kinds: HashMap<SubscriptionToken, EventKind>,
}

/// Registry of subscribers keyed by [`EventKind`].
pub struct EventBus<E> {
    subscriptions: Mutex<Subscriptions<E>>,
}

impl<E: BusEvent> EventBus<E> {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Subscriptions {
                next_token: 0,
                by_kind: HashMap::new(),
                kinds: HashMap::new(),
            }),
        }
    }

    /// Subscribe `callback` to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> SubscriptionToken
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut subscriptions = self.subscriptions.lock();

        let token = SubscriptionToken(subscriptions.next_token);
        subscriptions.next_token += 1;

        subscriptions
            .by_kind
            .entry(kind)
            .or_default()
            .push((token, Arc::new(callback)));
        subscriptions.kinds.insert(token, kind);

        token
    }

    /// Remove the subscription behind `token`. Returns false if it was already gone.
    pub fn off(&self, token: SubscriptionToken) -> bool {
        let mut subscriptions = self.subscriptions.lock();

        let Some(kind) = subscriptions.kinds.remove(&token) else {
            return false;
        };

        if let Some(callbacks) = subscriptions.by_kind.get_mut(&kind) {
            callbacks.retain(|(existing, _)| *existing != token);
        }

        true
    }

    /// Invoke every subscriber of `event.kind()` in subscription order.
    ///
    /// Callbacks run without the bus locked. Failures do not stop dispatch and
    /// are handed back to the caller.
    pub fn emit(&self, event: &E) -> Vec<anyhow::Error> {
        let callbacks: Vec<Callback<E>> = {
            let subscriptions = self.subscriptions.lock();
            subscriptions
                .by_kind
                .get(&event.kind())
                .map(|callbacks| callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };

        callbacks
            .into_iter()
            .filter_map(|callback| callback(event).err())
            .collect()
    }

    /// Number of live subscriptions for `kind`.
    #[must_use]
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscriptions
            .lock()
            .by_kind
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subscriptions = self.subscriptions.lock();
        f.debug_struct("EventBus")
            .field("subscriptions", &subscriptions.kinds.len())
            .finish()
    }
}
