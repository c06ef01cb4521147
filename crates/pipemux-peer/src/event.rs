use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Subscriber<A, B> = Arc<dyn Fn(&A, &B) + Send + Sync>;

/// A notification with an explicit subscriber list.
///
/// Zero subscribers is a safe no-op; multiple subscribers all fire, in
/// subscription order. `emit` snapshots the list and invokes callbacks
/// outside the lock, so a callback may subscribe or unsubscribe without
/// deadlocking.
///
/// Events carry up to two borrowed arguments; single-argument events use
/// the default `B = ()`.
pub struct Event<A, B = ()> {
    subscribers: Mutex<Vec<(usize, Subscriber<A, B>)>>,
    next_token: AtomicUsize,
}

impl<A, B> Event<A, B> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_token: AtomicUsize::new(1),
        }
    }

    /// Add a subscriber. Returns a token for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, subscriber: impl Fn(&A, &B) + Send + Sync + 'static) -> usize {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.lock().push((token, Arc::new(subscriber)));
        token
    }

    /// Remove a subscriber. Returns whether the token was present.
    pub fn unsubscribe(&self, token: usize) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(t, _)| *t != token);
        subscribers.len() != before
    }

    /// Invoke every subscriber with the given arguments.
    pub fn emit(&self, a: &A, b: &B) {
        let snapshot: Vec<Subscriber<A, B>> =
            self.lock().iter().map(|(_, s)| Arc::clone(s)).collect();
        for subscriber in snapshot {
            subscriber(a, b);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(usize, Subscriber<A, B>)>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A, B> Default for Event<A, B> {
    fn default() -> Self {
        Self::new()
    }
}
