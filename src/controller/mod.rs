//! Per-consumer synchronization controllers.
//!
//! A [`SyncController`] owns one consumer's view of a remote table:
//! - Initial fetch, then a one-shot probe of the push path
//! - Live updates through the shared registry, or fallback polling
//! - Optimistic local updates guarded by a sequence token
//! - Change notifications through [`SyncController::watch`]
//!
//! # Example
//!
//! ```ignore
//! let orders = SyncController::<Order>::start(
//!     Arc::clone(&registry),
//!     Arc::clone(&source),
//!     Filter::eq("locationId", "L1"),
//!     SyncOptions::new().on_new_record(|order: &Order| println!("new order {}", order.id)),
//!     SyncConfig::default(),
//! )?;
//!
//! let changes = orders.watch();
//! while let Ok(event) = changes.recv() {
//!     if let SyncEvent::SnapshotChanged { .. } = event {
//!         render(&orders.snapshot());
//!     }
//! }
//! ```

mod sync;
mod types;

pub use sync::SyncController;
pub use types::{
    ChangeReceiver, FetchOutcome, NewRecordHook, Phase, SyncConfig, SyncEvent, SyncOptions,
};
