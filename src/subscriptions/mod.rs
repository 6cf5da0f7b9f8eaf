//! Channel multiplexing for live table updates.
//!
//! Many consumers may want the same `(entity kind, filter)` stream. The
//! registry keeps one physical push channel per canonical key and fans
//! every signal out to all callbacks registered for it:
//! - Filters are canonicalized, so column order never creates duplicates
//! - Callbacks run in subscription order, each behind a panic boundary
//! - The channel closes exactly once, when its last callback leaves
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(SubscriptionRegistry::new(provider));
//!
//! let guard = registry.subscribe(EntityKind::Orders, &Filter::eq("locationId", "L1"), |signal| {
//!     if let ChannelSignal::Change(event) = signal {
//!         println!("{:?} on {}", event.event_type, event.table);
//!     }
//! })?;
//!
//! // Dropping (or unsubscribing) the last guard closes the channel.
//! guard.unsubscribe();
//! ```

mod manager;
mod types;

pub use manager::SubscriptionRegistry;
pub use types::{Callback, CallbackId, SubscriptionGuard, SubscriptionKey};
