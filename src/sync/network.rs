use futures::{Stream, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityChange {
    BecameOnline,
    BecameOffline,
}

pub type ConnectivityListener = Arc<dyn Fn(ConnectivityChange) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Listeners {
    entries: Vec<(SubscriptionId, ConnectivityListener)>,
    next_id: u64,
}

/// Tracks device connectivity as reported by the platform.
///
/// Listeners run synchronously, on the caller of [`NetworkMonitor::set_online`],
/// and only when the state actually flips. Listeners that start async work,
/// like the offline queue's reconnect flush, need a tokio runtime: either the
/// caller's or one captured when they subscribed.
pub struct NetworkMonitor {
    state: watch::Sender<bool>,
    listeners: Mutex<Listeners>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self {
            state,
            listeners: Mutex::new(Listeners::default()),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Receiver for async consumers that prefer awaiting changes over callbacks.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(ConnectivityChange) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut listeners = self.listeners.lock().expect("network listeners poisoned");
        listeners.next_id += 1;
        let id = SubscriptionId(listeners.next_id);
        listeners.entries.push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock().expect("network listeners poisoned");
        let before = listeners.entries.len();
        listeners.entries.retain(|(existing, _)| *existing != id);
        listeners.entries.len() != before
    }

    /// Feeds one platform connectivity reading. Returns whether it was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return false;
        }

        let change = if online {
            ConnectivityChange::BecameOnline
        } else {
            ConnectivityChange::BecameOffline
        };
        info!(?change, "connectivity changed");

        let listeners: Vec<ConnectivityListener> = {
            let listeners = self.listeners.lock().expect("network listeners poisoned");
            listeners
                .entries
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect()
        };
        for listener in listeners {
            listener(change);
        }
        true
    }

    /// Drives the monitor from a platform signal until the signal ends.
    pub async fn track<S>(&self, signal: S)
    where
        S: Stream<Item = bool>,
    {
        let mut signal = std::pin::pin!(signal);
        while let Some(online) = signal.next().await {
            self.set_online(online);
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
