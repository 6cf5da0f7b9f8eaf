//! Subscription types for the channel registry.

use crate::channel::ChannelSignal;
use crate::types::{EntityKind, Filter};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::manager::RegistryInner;

/// Canonical identity of one logical subscription.
///
/// Built from the table name and the filter rendered as JSON with sorted
/// columns, so filters that differ only in insertion order share a key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn new(kind: EntityKind, filter: &Filter) -> Self {
        // Filter is a sorted map and always serializes.
        let filter_json = serde_json::to_string(filter).unwrap_or_default();
        SubscriptionKey(format!("{}:{}", kind.table(), filter_json))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short channel name for providers that limit topic length.
    pub fn topic(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        let table = self.0.split(':').next().unwrap_or_default();
        format!("{}-{}", table, hex::encode(&digest[..6]))
    }
}

impl fmt::Debug for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionKey({})", self.0)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one callback within a key's callback set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u64);

/// Listener invoked for every signal on a channel.
pub type Callback = Arc<dyn Fn(&ChannelSignal) + Send + Sync>;

/// Handle returned by [`SubscriptionRegistry::subscribe`](super::SubscriptionRegistry::subscribe).
///
/// Dropping the guard unsubscribes.
pub struct SubscriptionGuard {
    pub(super) id: CallbackId,
    pub(super) key: SubscriptionKey,
    pub(super) registry: Weak<RegistryInner>,
    pub(super) active: AtomicBool,
}

impl SubscriptionGuard {
    pub fn id(&self) -> CallbackId {
        self.id
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Remove the callback, closing the channel if it was the last one.
    ///
    /// Returns false if this guard was already unsubscribed.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        match self.registry.upgrade() {
            Some(registry) => registry.remove_callback(&self.key, self.id),
            None => false,
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}
