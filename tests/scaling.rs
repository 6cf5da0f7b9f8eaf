//! Scaling tests for many consumers over shared channels.

use livesync::{
    EntityKind, Filter, MemoryBackend, Order, OrderStatus, PushMode, SubscriptionRegistry,
    SyncConfig, SyncController, SyncOptions,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const LOCATIONS: usize = 10;
const CONSUMERS_PER_LOCATION: usize = 20;

fn seeded_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    let rows = (0..LOCATIONS * 5)
        .map(|i| json!({"id": format!("o{}", i), "status": "pending", "locationId": format!("L{}", i % LOCATIONS)}))
        .collect();
    backend.seed(EntityKind::Orders, rows);
    backend
}

#[tokio::test(start_paused = true)]
async fn test_many_consumers_share_channels() {
    let backend = seeded_backend();
    let registry = Arc::new(SubscriptionRegistry::new(Arc::new(backend.clone())));

    let mut controllers = Vec::new();
    for location in 0..LOCATIONS {
        for _ in 0..CONSUMERS_PER_LOCATION {
            controllers.push(
                SyncController::<Order>::start(
                    Arc::clone(&registry),
                    Arc::new(backend.clone()),
                    Filter::eq("locationId", format!("L{}", location)),
                    SyncOptions::new(),
                    SyncConfig::default(),
                )
                .unwrap(),
            );
        }
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(registry.channel_count(), LOCATIONS);
    assert!(controllers.iter().all(|c| c.snapshot().len() == 5));

    // One change reaches exactly the consumers of its location.
    backend.update(EntityKind::Orders, "o3", json!({"status": "ready"}));
    tokio::time::sleep(Duration::from_millis(10)).await;
    let updated = controllers
        .iter()
        .filter(|c| c.snapshot().iter().any(|o| o.status == OrderStatus::Ready))
        .count();
    assert_eq!(updated, CONSUMERS_PER_LOCATION);

    controllers.clear();
    assert_eq!(registry.channel_count(), 0);
    assert!(backend.open_topics().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_polling_consumers_stay_independent() {
    let backend = seeded_backend();
    backend.set_push_mode(PushMode::Silent);
    let registry = Arc::new(SubscriptionRegistry::new(Arc::new(backend.clone())));

    let controllers: Vec<_> = (0..LOCATIONS)
        .map(|location| {
            SyncController::<Order>::start(
                Arc::clone(&registry),
                Arc::new(backend.clone()),
                Filter::eq("locationId", format!("L{}", location)),
                SyncOptions::new(),
                SyncConfig::default(),
            )
            .unwrap()
        })
        .collect();

    tokio::time::sleep(Duration::from_secs(4)).await;
    backend.delete(EntityKind::Orders, "o0");
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(controllers[0].snapshot().len(), 4);
    assert!(controllers[1..].iter().all(|c| c.snapshot().len() == 5));
    assert_eq!(registry.channel_count(), 0);
}
