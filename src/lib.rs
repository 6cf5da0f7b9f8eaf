//! # Live Sync
//!
//! Keeps local snapshots of remote tables in sync for many independent
//! consumers, using push notifications when they work and polling when
//! they do not.
//!
//! ## Core Concepts
//!
//! - **Registry**: One physical push channel per `(table, filter)`, shared by every interested consumer
//! - **Probe**: One-shot check that the push path delivers end to end
//! - **Poller**: Fixed-cadence re-fetch while the consumer is active
//! - **Detector**: Decides whether a fetched list differs in a way that matters
//! - **Controller**: Per-consumer state machine with optimistic updates
//!
//! ## Example
//!
//! ```ignore
//! use livesync::{Filter, MemoryBackend, Order, SubscriptionRegistry, SyncConfig, SyncController, SyncOptions};
//!
//! let backend = MemoryBackend::new();
//! let registry = Arc::new(SubscriptionRegistry::new(Arc::new(backend.clone())));
//!
//! let orders = SyncController::<Order>::start(
//!     registry,
//!     Arc::new(backend),
//!     Filter::eq("locationId", "L1"),
//!     SyncOptions::new(),
//!     SyncConfig::default(),
//! )?;
//!
//! // Hide a deleted row right away; the next accepted fetch confirms it.
//! orders.optimistic_update(|prev| prev.iter().filter(|o| o.id != "o42").cloned().collect());
//! ```

pub mod channel;
pub mod controller;
pub mod detect;
pub mod entities;
pub mod error;
pub mod memory;
pub mod poller;
pub mod probe;
pub mod source;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use channel::{
    ChannelEvent, ChannelProvider, ChannelSignal, ChannelSink, ChannelSpec, ChannelStatus, EventType,
    PushChannel,
};
pub use controller::{
    ChangeReceiver, FetchOutcome, NewRecordHook, Phase, SyncConfig, SyncController, SyncEvent,
    SyncOptions,
};
pub use detect::{changed, first_difference, Difference};
pub use entities::{
    decode_rows, Driver, DriverRef, DriverStatus, Entity, Order, OrderStatus, Record, StaffMember,
};
pub use error::{Result, SyncError};
pub use memory::{MemoryBackend, PushMode};
pub use poller::{ActiveCheck, FallbackPoller, Tick, POLL_INTERVAL_DEGRADED, POLL_INTERVAL_SAFETY_NET};
pub use probe::{ConnectionProbe, ProbeScope, PROBE_TIMEOUT};
pub use source::{DataSource, SharedDataSource};
pub use subscriptions::{Callback, CallbackId, SubscriptionGuard, SubscriptionKey, SubscriptionRegistry};
pub use types::*;
