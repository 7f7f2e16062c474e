//! First-signal-wins rendezvous between two independent events
//!
//! One side registers interest in a key and waits with a deadline; the other
//! side signals the key when the matching value shows up. Whichever happens
//! first decides the outcome and the other becomes a no-op. The table is not
//! synchronised itself: callers keep it behind the same lock that guards the
//! collection being searched, so a lookup and a registration are atomic with
//! respect to the signalling side.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::oneshot;

struct Waiter<V> {
    token: u64,
    tx: oneshot::Sender<V>,
}

/// Pending registrations, keyed by what they wait for
pub struct Rendezvous<K, V> {
    waiters: HashMap<K, Waiter<V>>,
    next_token: u64,
}

/// How a wait ended
#[derive(Debug, PartialEq, Eq)]
pub enum RendezvousOutcome<V> {
    Matched(V),
    TimedOut,
    /// A newer registration for the same key replaced this one.
    Superseded,
}

impl<V> RendezvousOutcome<V> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RendezvousOutcome::TimedOut)
    }
}

/// The waiting half of a registration
pub struct PendingSignal<K, V> {
    key: K,
    token: u64,
    rx: oneshot::Receiver<V>,
}

impl<K, V> Rendezvous<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            waiters: HashMap::new(),
            next_token: 0,
        }
    }

    /// Wait for `key`. A previous registration for the same key is superseded.
    pub fn register(&mut self, key: K) -> PendingSignal<K, V> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token;
        self.next_token += 1;
        self.waiters.insert(key.clone(), Waiter { token, tx });
        PendingSignal { key, token, rx }
    }

    /// Hand `value` to whoever waits for `key`. Returns the value back when
    /// nobody is waiting any more.
    pub fn signal(&mut self, key: &K, value: V) -> Option<V> {
        match self.waiters.remove(key) {
            Some(waiter) => waiter.tx.send(value).err(),
            None => Some(value),
        }
    }

    /// Withdraw a registration, unless a newer one has taken its place.
    pub fn cancel(&mut self, signal: &PendingSignal<K, V>) {
        if self
            .waiters
            .get(&signal.key)
            .is_some_and(|waiter| waiter.token == signal.token)
        {
            self.waiters.remove(&signal.key);
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.waiters.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl<K, V> Default for Rendezvous<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> PendingSignal<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Wait up to `timeout` for the matching signal.
    pub async fn wait(&mut self, timeout: Duration) -> RendezvousOutcome<V> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(value)) => RendezvousOutcome::Matched(value),
            Ok(Err(_)) => RendezvousOutcome::Superseded,
            Err(_) => RendezvousOutcome::TimedOut,
        }
    }

    /// Value delivered after the deadline passed but before the registration
    /// was cancelled. Only meaningful once `cancel` ran under the table lock.
    pub fn take_late(&mut self) -> Option<V> {
        self.rx.try_recv().ok()
    }
}
