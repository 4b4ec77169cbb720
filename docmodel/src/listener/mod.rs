// Named realtime listeners

use crate::error::{DocModelError, Result};
use crate::store::Subscription;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Identifies one registration of a name, so a stale guard cannot remove a
/// later listener that reused the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

enum Slot {
    /// Name reserved while the store subscription is being set up.
    Pending(ListenerToken),
    Active {
        token: ListenerToken,
        subscription: Subscription,
    },
}

impl Slot {
    fn token(&self) -> ListenerToken {
        match self {
            Slot::Pending(token) | Slot::Active { token, .. } => *token,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    slots: Mutex<HashMap<String, Slot>>,
    next_token: AtomicU64,
}

/// Name-keyed map of live subscriptions. Cloning shares the map.
///
/// A name maps to at most one subscription; registering a taken name fails
/// with [`DocModelError::DuplicateListener`] instead of replacing the first.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        ListenerRegistry::default()
    }

    /// Reserve `name`, run `subscribe` and keep the resulting subscription
    /// under that name.
    ///
    /// `subscribe` runs without the registry lock held. If it fails the name
    /// is released again and the error is returned.
    pub fn register<F>(&self, name: &str, subscribe: F) -> Result<ListenerToken>
    where
        F: FnOnce() -> Result<Subscription>,
    {
        let token = ListenerToken(self.inner.next_token.fetch_add(1, Ordering::SeqCst));
        {
            let mut slots = self.inner.slots.lock();
            if slots.contains_key(name) {
                return Err(DocModelError::DuplicateListener {
                    name: name.to_string(),
                });
            }
            slots.insert(name.to_string(), Slot::Pending(token));
        }

        let subscription = match subscribe() {
            Ok(subscription) => subscription,
            Err(e) => {
                self.take_if(name, token);
                return Err(e);
            }
        };

        let displaced = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(name) {
                Some(slot) if slot.token() == token => {
                    *slot = Slot::Active {
                        token,
                        subscription,
                    };
                    None
                }
                // Removed while subscribing.
                _ => Some(subscription),
            }
        };

        match displaced {
            Some(subscription) => {
                subscription.unsubscribe();
                log::debug!("Listener '{name}' was removed before it became active");
            }
            None => log::debug!("Registered listener '{name}'"),
        }
        Ok(token)
    }

    /// Like [`register`](Self::register), returning a guard that removes the
    /// listener when disposed or dropped.
    pub fn register_scoped<F>(&self, name: &str, subscribe: F) -> Result<ListenerGuard>
    where
        F: FnOnce() -> Result<Subscription>,
    {
        let token = self.register(name, subscribe)?;
        Ok(ListenerGuard {
            registry: self.clone(),
            name: name.to_string(),
            token: Some(token),
        })
    }

    /// Unsubscribe and forget `name`. Returns whether it was registered.
    pub fn remove(&self, name: &str) -> bool {
        let slot = self.inner.slots.lock().remove(name);
        match slot {
            Some(slot) => {
                drop(slot);
                log::debug!("Removed listener '{name}'");
                true
            }
            None => false,
        }
    }

    /// Remove `name` only if it still belongs to the registration `token`.
    pub fn remove_if(&self, name: &str, token: ListenerToken) -> bool {
        self.take_if(name, token)
    }

    fn take_if(&self, name: &str, token: ListenerToken) -> bool {
        let slot = {
            let mut slots = self.inner.slots.lock();
            if slots.get(name).map(Slot::token) == Some(token) {
                slots.remove(name)
            } else {
                None
            }
        };
        slot.is_some()
    }

    /// Unsubscribe every listener in this registry.
    pub fn remove_all(&self) {
        let drained: Vec<(String, Slot)> = self.inner.slots.lock().drain().collect();
        if !drained.is_empty() {
            log::debug!("Removed {} listeners", drained.len());
        }
        drop(drained);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.slots.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.slots.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Disposer for a scoped listener.
#[must_use = "the listener is removed as soon as the guard is dropped"]
pub struct ListenerGuard {
    registry: ListenerRegistry,
    name: String,
    token: Option<ListenerToken>,
}

impl ListenerGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the listener now.
    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(token) = self.token.take() {
            self.registry.remove_if(&self.name, token);
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("name", &self.name)
            .field("active", &self.token.is_some())
            .finish()
    }
}

/// Latest payload of a state-mirroring listener.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListenerState<T> {
    pub value: T,
    /// Set once the first snapshot has been delivered.
    pub initial_fetch_completed: bool,
}

/// Write side of a [`WatchedListener`], handed to the subscribing callback.
pub struct StatePublisher<T> {
    sender: Arc<watch::Sender<ListenerState<T>>>,
}

impl<T> Clone for StatePublisher<T> {
    fn clone(&self) -> Self {
        StatePublisher {
            sender: self.sender.clone(),
        }
    }
}

impl<T> StatePublisher<T> {
    pub fn publish(&self, value: T) {
        self.sender.send_replace(ListenerState {
            value,
            initial_fetch_completed: true,
        });
    }
}

/// A scoped listener whose latest payload is kept as observable state.
pub struct WatchedListener<T> {
    state: watch::Receiver<ListenerState<T>>,
    guard: ListenerGuard,
}

impl<T: Default + Send + Sync + 'static> WatchedListener<T> {
    /// Register `name`; `subscribe` receives the publisher its callback
    /// should feed.
    pub fn register<F>(registry: &ListenerRegistry, name: &str, subscribe: F) -> Result<Self>
    where
        F: FnOnce(StatePublisher<T>) -> Result<Subscription>,
    {
        let (sender, state) = watch::channel(ListenerState::default());
        let publisher = StatePublisher {
            sender: Arc::new(sender),
        };
        let guard = registry.register_scoped(name, move || subscribe(publisher))?;
        Ok(WatchedListener { state, guard })
    }

    pub fn name(&self) -> &str {
        self.guard.name()
    }

    pub fn initial_fetch_completed(&self) -> bool {
        self.state.borrow().initial_fetch_completed
    }

    /// Wait for the next delivered snapshot.
    pub async fn changed(&mut self) -> Result<()> {
        self.state
            .changed()
            .await
            .map_err(|_| DocModelError::Store(format!("listener '{}' closed", self.guard.name())))
    }

    /// Remove the underlying listener.
    pub fn dispose(self) {
        self.guard.dispose();
    }
}

impl<T: Clone> WatchedListener<T> {
    pub fn current(&self) -> ListenerState<T> {
        self.state.borrow().clone()
    }

    /// Latest value and whether the first snapshot has arrived.
    pub fn snapshot(&self) -> (T, bool) {
        let state = self.state.borrow();
        (state.value.clone(), state.initial_fetch_completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_subscription(cancelled: &Arc<AtomicUsize>) -> Subscription {
        let cancelled = cancelled.clone();
        Subscription::new(move || {
            cancelled.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_duplicate_name_rejected_until_removed() {
        let registry = ListenerRegistry::new();
        let cancelled = Arc::new(AtomicUsize::new(0));

        registry
            .register("profile", || Ok(counting_subscription(&cancelled)))
            .unwrap();
        let err = registry
            .register("profile", || Ok(counting_subscription(&cancelled)))
            .unwrap_err();
        assert!(matches!(err, DocModelError::DuplicateListener { ref name } if name == "profile"));
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);

        assert!(registry.remove("profile"));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        registry
            .register("profile", || Ok(counting_subscription(&cancelled)))
            .unwrap();
        assert_eq!(registry.names(), vec!["profile".to_string()]);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let registry = ListenerRegistry::new();
        assert!(!registry.remove("missing"));
    }

    #[test]
    fn test_failed_subscribe_releases_name() {
        let registry = ListenerRegistry::new();
        let err = registry
            .register("feed", || Err(DocModelError::Store("offline".into())))
            .unwrap_err();
        assert!(err.is_store_error());
        assert!(!registry.contains("feed"));
    }

    #[test]
    fn test_remove_all_cancels_everything() {
        let registry = ListenerRegistry::new();
        let cancelled = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b", "c"] {
            registry
                .register(name, || Ok(counting_subscription(&cancelled)))
                .unwrap();
        }
        registry.remove_all();
        assert!(registry.is_empty());
        assert_eq!(cancelled.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_removal_during_subscribe_drops_subscription() {
        let registry = ListenerRegistry::new();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let inner = registry.clone();
        registry
            .register("racy", || {
                inner.remove("racy");
                Ok(counting_subscription(&cancelled))
            })
            .unwrap();
        assert!(!registry.contains("racy"));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_same_name_rejected_while_first_is_subscribing() {
        let registry = ListenerRegistry::new();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let subscribed = Arc::new(AtomicUsize::new(0));
        let inner = registry.clone();

        let mut second = None;
        registry
            .register("feed", || {
                second = Some(inner.register("feed", || {
                    subscribed.fetch_add(1, Ordering::SeqCst);
                    Ok(counting_subscription(&cancelled))
                }));
                subscribed.fetch_add(1, Ordering::SeqCst);
                Ok(counting_subscription(&cancelled))
            })
            .unwrap();

        let err = second.unwrap().unwrap_err();
        assert!(matches!(err, DocModelError::DuplicateListener { ref name } if name == "feed"));
        assert_eq!(subscribed.load(Ordering::SeqCst), 1);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("feed"));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_removes_only_its_registration() {
        let registry = ListenerRegistry::new();
        let cancelled = Arc::new(AtomicUsize::new(0));

        let stale = registry
            .register_scoped("doc", || Ok(counting_subscription(&cancelled)))
            .unwrap();
        registry.remove("doc");
        registry
            .register("doc", || Ok(counting_subscription(&cancelled)))
            .unwrap();

        drop(stale);
        assert!(registry.contains("doc"));

        let guard = registry.register_scoped("other", || Ok(counting_subscription(&cancelled)));
        guard.unwrap().dispose();
        assert!(!registry.contains("other"));
        assert_eq!(cancelled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_watched_listener_mirrors_state() {
        let registry = ListenerRegistry::new();
        let mut publisher = None;
        let mut watched: WatchedListener<Vec<u32>> =
            WatchedListener::register(&registry, "numbers", |p| {
                publisher = Some(p);
                Ok(Subscription::new(|| {}))
            })
            .unwrap();
        assert_eq!(watched.snapshot(), (vec![], false));

        let publisher = publisher.unwrap();
        publisher.publish(vec![1, 2]);
        watched.changed().await.unwrap();
        assert_eq!(
            watched.current(),
            ListenerState {
                value: vec![1, 2],
                initial_fetch_completed: true
            }
        );
        assert!(watched.initial_fetch_completed());

        watched.dispose();
        assert!(!registry.contains("numbers"));
    }
}
