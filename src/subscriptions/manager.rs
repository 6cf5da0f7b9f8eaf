//! Subscription registry multiplexing logical subscriptions onto channels.

use crate::channel::{ChannelProvider, ChannelSignal, ChannelSink, ChannelSpec, ChannelStatus, PushChannel};
use crate::error::{Result, SyncError};
use crate::types::{EntityKind, Filter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::types::{Callback, CallbackId, SubscriptionGuard, SubscriptionKey};

/// One physical channel and everyone listening to it.
struct ChannelEntry {
    /// Distinguishes this entry from a later one under the same key.
    generation: u64,
    topic: String,
    /// None while the provider is still opening the channel.
    handle: Option<Box<dyn PushChannel>>,
    /// Listeners in subscription order.
    callbacks: Vec<(CallbackId, Callback)>,
    /// Signals fanned out so far.
    delivered: u64,
}

pub(crate) struct RegistryInner {
    provider: Arc<dyn ChannelProvider>,
    channels: Mutex<HashMap<SubscriptionKey, ChannelEntry>>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    shut_down: AtomicBool,
}

impl RegistryInner {
    /// Remove a callback. Closes the channel when the set becomes empty.
    pub(crate) fn remove_callback(&self, key: &SubscriptionKey, id: CallbackId) -> bool {
        let emptied = {
            let mut channels = self.channels.lock();
            let Some(entry) = channels.get_mut(key) else {
                return false;
            };
            let before = entry.callbacks.len();
            entry.callbacks.retain(|(cb_id, _)| *cb_id != id);
            if entry.callbacks.len() == before {
                return false;
            }
            if entry.callbacks.is_empty() {
                channels.remove(key)
            } else {
                None
            }
        };

        if let Some(entry) = emptied {
            tracing::debug!(key = %key, topic = %entry.topic, delivered = entry.delivered, "last subscriber left, closing channel");
            if let Some(handle) = entry.handle {
                handle.close();
            }
        }
        true
    }

    /// Fan a signal out to a copy of the key's callback set.
    fn dispatch(&self, key: &SubscriptionKey, generation: u64, signal: ChannelSignal) {
        let callbacks: Vec<Callback> = {
            let mut channels = self.channels.lock();
            match channels.get_mut(key) {
                Some(entry) if entry.generation == generation => {
                    entry.delivered += 1;
                    entry.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect()
                }
                // Channel was closed or replaced; late signal.
                _ => return,
            }
        };

        fan_out(key, &callbacks, &signal);
    }

    /// Close every channel, returning each key's former listeners.
    fn close_all(&self) -> Vec<(SubscriptionKey, Vec<Callback>)> {
        let drained: Vec<(SubscriptionKey, ChannelEntry)> = self.channels.lock().drain().collect();
        drained
            .into_iter()
            .map(|(key, entry)| {
                tracing::debug!(key = %key, topic = %entry.topic, "closing channel on shutdown");
                if let Some(handle) = entry.handle {
                    handle.close();
                }
                let callbacks = entry.callbacks.into_iter().map(|(_, cb)| cb).collect();
                (key, callbacks)
            })
            .collect()
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Deliver `signal` to each callback behind its own panic boundary.
fn fan_out(key: &SubscriptionKey, callbacks: &[Callback], signal: &ChannelSignal) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(signal))).is_err() {
            tracing::error!(key = %key, signal = ?signal, "subscription callback panicked");
        }
    }
}

/// Deduplicates physical channels by subscription key and fans events out
/// to every interested callback.
///
/// Construct one per process (or per test) and share it with
/// [`SyncController`](crate::SyncController)s through an `Arc`.
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    /// Create a registry opening channels through `provider`.
    pub fn new(provider: Arc<dyn ChannelProvider>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                provider,
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Register `callback` for `(kind, filter)`.
    ///
    /// Opens a channel only if no live channel exists for the canonical key.
    /// The callback is appended to the key's set, so delivery follows
    /// subscription order.
    pub fn subscribe<F>(&self, kind: EntityKind, filter: &Filter, callback: F) -> Result<SubscriptionGuard>
    where
        F: Fn(&ChannelSignal) + Send + Sync + 'static,
    {
        if self.is_shut_down() {
            return Err(SyncError::RegistryShutdown);
        }

        let key = SubscriptionKey::new(kind, filter);
        let id = CallbackId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let callback: Callback = Arc::new(callback);

        let needs_open = {
            let mut channels = self.inner.channels.lock();
            match channels.get_mut(&key) {
                Some(entry) => {
                    entry.callbacks.push((id, callback));
                    None
                }
                None => {
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
                    channels.insert(
                        key.clone(),
                        ChannelEntry {
                            generation,
                            topic: key.topic(),
                            handle: None,
                            callbacks: vec![(id, callback)],
                            delivered: 0,
                        },
                    );
                    Some(generation)
                }
            }
        };

        if let Some(generation) = needs_open {
            self.open(&key, kind, filter, generation)?;
        } else {
            tracing::trace!(key = %key, callback = id.0, "reusing existing channel");
        }

        Ok(SubscriptionGuard {
            id,
            key,
            registry: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        })
    }

    /// Open the physical channel for a freshly inserted entry.
    ///
    /// The entry exists before the provider is called so that signals sent
    /// during `open_channel` already reach the callback set.
    fn open(&self, key: &SubscriptionKey, kind: EntityKind, filter: &Filter, generation: u64) -> Result<()> {
        let spec = ChannelSpec::new(key.topic(), kind.table(), filter.clone());
        let sink = {
            let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
            let key = key.clone();
            ChannelSink::new(move |signal| {
                if let Some(registry) = registry.upgrade() {
                    registry.dispatch(&key, generation, signal);
                }
            })
        };

        match self.inner.provider.open_channel(&spec, sink) {
            Ok(handle) => {
                let orphan = {
                    let mut channels = self.inner.channels.lock();
                    match channels.get_mut(key) {
                        Some(entry) if entry.generation == generation => {
                            entry.handle = Some(handle);
                            None
                        }
                        _ => Some(handle),
                    }
                };
                match orphan {
                    // Everyone left (or shutdown ran) while opening.
                    Some(handle) => handle.close(),
                    None => tracing::debug!(key = %key, topic = %spec.topic, "channel opened"),
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to open channel");
                let mut channels = self.inner.channels.lock();
                if channels.get(key).is_some_and(|entry| entry.generation == generation) {
                    channels.remove(key);
                }
                Err(e)
            }
        }
    }

    /// Provider this registry opens channels with.
    pub fn provider(&self) -> Arc<dyn ChannelProvider> {
        Arc::clone(&self.inner.provider)
    }

    /// Close every channel and refuse further subscriptions.
    ///
    /// Current subscribers receive `Status(Closed)` once per channel, after
    /// the registry has let go of it.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained = self.inner.close_all();
        tracing::debug!(closed = drained.len(), "subscription registry shut down");

        let closed = ChannelSignal::Status(ChannelStatus::Closed);
        for (key, callbacks) in &drained {
            fan_out(key, callbacks, &closed);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Number of live physical channels.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    /// Number of callbacks registered for `(kind, filter)`.
    pub fn callback_count(&self, kind: EntityKind, filter: &Filter) -> usize {
        let key = SubscriptionKey::new(kind, filter);
        self.inner
            .channels
            .lock()
            .get(&key)
            .map(|entry| entry.callbacks.len())
            .unwrap_or(0)
    }

    /// Keys with a live channel, sorted.
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self.inner.channels.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelEvent, ChannelStatus};
    use crate::memory::{MemoryBackend, PushMode};
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    fn setup() -> (MemoryBackend, SubscriptionRegistry) {
        let backend = MemoryBackend::new();
        let registry = SubscriptionRegistry::new(Arc::new(backend.clone()));
        (backend, registry)
    }

    fn recorder() -> (Arc<PlMutex<Vec<ChannelSignal>>>, impl Fn(&ChannelSignal) + Send + Sync + 'static) {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |signal: &ChannelSignal| sink.lock().push(signal.clone()))
    }

    #[test]
    fn test_same_key_reuses_channel() {
        let (backend, registry) = setup();
        let f1 = Filter::eq("locationId", "L1").and("status", "ready");
        let f2 = Filter::eq("status", "ready").and("locationId", "L1");

        let _a = registry.subscribe(EntityKind::Orders, &f1, |_| {}).unwrap();
        let _b = registry.subscribe(EntityKind::Orders, &f2, |_| {}).unwrap();

        assert_eq!(registry.channel_count(), 1);
        assert_eq!(backend.opened_channels(), 1);
        assert_eq!(registry.callback_count(EntityKind::Orders, &f1), 2);
    }

    #[test]
    fn test_different_kinds_get_separate_channels() {
        let (backend, registry) = setup();
        let filter = Filter::eq("locationId", "L1");
        let _a = registry.subscribe(EntityKind::Orders, &filter, |_| {}).unwrap();
        let _b = registry.subscribe(EntityKind::Drivers, &filter, |_| {}).unwrap();
        assert_eq!(backend.opened_channels(), 2);
        assert_eq!(registry.keys().len(), 2);
    }

    #[test]
    fn test_last_unsubscribe_closes_once() {
        let (backend, registry) = setup();
        let filter = Filter::eq("locationId", "L1");
        let a = registry.subscribe(EntityKind::Orders, &filter, |_| {}).unwrap();
        let b = registry.subscribe(EntityKind::Orders, &filter, |_| {}).unwrap();

        assert!(a.unsubscribe());
        assert_eq!(backend.closed_channels(), 0);
        assert!(b.unsubscribe());
        assert_eq!(backend.closed_channels(), 1);

        assert!(!b.unsubscribe());
        assert!(!a.unsubscribe());
        drop(a);
        drop(b);
        assert_eq!(backend.closed_channels(), 1);
        assert_eq!(registry.channel_count(), 0);
    }

    #[test]
    fn test_fan_out_in_subscription_order() {
        let (backend, registry) = setup();
        let filter = Filter::eq("locationId", "L1");
        let order = Arc::new(PlMutex::new(Vec::new()));

        let mut guards = Vec::new();
        for n in 0..3 {
            let order = Arc::clone(&order);
            guards.push(
                registry
                    .subscribe(EntityKind::Orders, &filter, move |signal| {
                        if matches!(signal, ChannelSignal::Change(_)) {
                            order.lock().push(n);
                        }
                    })
                    .unwrap(),
            );
        }

        backend.insert(EntityKind::Orders, json!({"id": "o1", "status": "pending", "locationId": "L1"}));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_callback_isolated() {
        let (backend, registry) = setup();
        let filter = Filter::all();
        let (seen, record) = recorder();

        let _bad = registry
            .subscribe(EntityKind::Drivers, &filter, |signal| {
                if matches!(signal, ChannelSignal::Change(_)) {
                    panic!("listener bug");
                }
            })
            .unwrap();
        let _good = registry.subscribe(EntityKind::Drivers, &filter, record).unwrap();

        backend.insert(EntityKind::Drivers, json!({"id": "d1", "status": "available"}));
        backend.insert(EntityKind::Drivers, json!({"id": "d2", "status": "available"}));

        let changes = seen
            .lock()
            .iter()
            .filter(|s| matches!(s, ChannelSignal::Change(_)))
            .count();
        assert_eq!(changes, 2);
    }

    #[test]
    fn test_unsubscribe_during_fan_out() {
        let (backend, registry) = setup();
        let filter = Filter::all();
        let registry = Arc::new(registry);
        let slot: Arc<PlMutex<Option<SubscriptionGuard>>> = Arc::new(PlMutex::new(None));

        let slot_in_cb = Arc::clone(&slot);
        let guard = registry
            .subscribe(EntityKind::Staff, &filter, move |signal| {
                if matches!(signal, ChannelSignal::Change(_)) {
                    if let Some(guard) = slot_in_cb.lock().take() {
                        guard.unsubscribe();
                    }
                }
            })
            .unwrap();
        *slot.lock() = Some(guard);
        let (seen, record) = recorder();
        let _second = registry.subscribe(EntityKind::Staff, &filter, record).unwrap();

        backend.insert(EntityKind::Staff, json!({"id": "s1", "role": "cook"}));

        // The second listener still got the event from the pre-mutation copy.
        assert!(seen.lock().iter().any(|s| matches!(s, ChannelSignal::Change(_))));
        assert_eq!(registry.callback_count(EntityKind::Staff, &filter), 1);
        assert_eq!(backend.closed_channels(), 0);
    }

    #[test]
    fn test_open_failure_leaves_no_entry() {
        let (backend, registry) = setup();
        backend.set_push_mode(PushMode::Refuse);
        let result = registry.subscribe(EntityKind::Orders, &Filter::all(), |_| {});
        assert!(matches!(result, Err(SyncError::Channel { .. })));
        assert_eq!(registry.channel_count(), 0);

        backend.set_push_mode(PushMode::Live);
        let _guard = registry.subscribe(EntityKind::Orders, &Filter::all(), |_| {}).unwrap();
        assert_eq!(registry.channel_count(), 1);
    }

    #[test]
    fn test_status_signals_fan_out() {
        let (backend, registry) = setup();
        let (seen, record) = recorder();
        let _guard = registry.subscribe(EntityKind::Orders, &Filter::all(), record).unwrap();

        backend.break_channels("orders", "socket reset");

        let seen = seen.lock();
        assert_eq!(seen.first(), Some(&ChannelSignal::Status(ChannelStatus::Subscribed)));
        assert_eq!(
            seen.last(),
            Some(&ChannelSignal::Status(ChannelStatus::Error("socket reset".into())))
        );
    }

    #[test]
    fn test_events_outside_filter_not_delivered() {
        let (backend, registry) = setup();
        let (seen, record) = recorder();
        let _guard = registry
            .subscribe(EntityKind::Orders, &Filter::eq("locationId", "L1"), record)
            .unwrap();

        backend.emit(ChannelEvent::insert("orders", json!({"id": "x", "status": "pending", "locationId": "L2"})));
        assert!(!seen.lock().iter().any(|s| matches!(s, ChannelSignal::Change(_))));
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let (backend, registry) = setup();
        let a = registry.subscribe(EntityKind::Orders, &Filter::all(), |_| {}).unwrap();
        let _b = registry.subscribe(EntityKind::Drivers, &Filter::all(), |_| {}).unwrap();

        registry.shutdown();
        registry.shutdown();
        assert_eq!(backend.closed_channels(), 2);
        assert_eq!(registry.channel_count(), 0);
        assert!(!a.unsubscribe());
        assert!(matches!(
            registry.subscribe(EntityKind::Staff, &Filter::all(), |_| {}),
            Err(SyncError::RegistryShutdown)
        ));
        assert_eq!(backend.closed_channels(), 2);
    }

    #[test]
    fn test_shutdown_tells_subscribers_once() {
        let (_backend, registry) = setup();
        let (seen, record) = recorder();
        let _panicky = registry
            .subscribe(EntityKind::Orders, &Filter::all(), |signal| {
                if let ChannelSignal::Status(ChannelStatus::Closed) = signal {
                    panic!("listener bug");
                }
            })
            .unwrap();
        let _guard = registry.subscribe(EntityKind::Orders, &Filter::all(), record).unwrap();

        registry.shutdown();
        registry.shutdown();

        let closed = seen
            .lock()
            .iter()
            .filter(|s| **s == ChannelSignal::Status(ChannelStatus::Closed))
            .count();
        assert_eq!(closed, 1);
    }

    #[test]
    fn test_topic_is_stable_and_short() {
        let key = SubscriptionKey::new(EntityKind::Orders, &Filter::eq("locationId", "L1"));
        assert_eq!(key.as_str(), r#"orders:{"locationId":"L1"}"#);
        assert_eq!(key.topic(), key.clone().topic());
        assert!(key.topic().starts_with("orders-"));
        assert_eq!(key.topic().len(), "orders-".len() + 12);
    }
}
