//! Structural change detection between two record lists.
//!
//! A newly fetched list only replaces the accepted snapshot when it differs
//! in a way a consumer must react to: membership, order, or a watched field.
//! Unwatched fields (timestamps, display names) are ignored.

use crate::entities::Record;

/// First reason two record lists differ.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Difference {
    /// Different number of records.
    Length { old: usize, new: usize },
    /// Different id at this position (added, removed or reordered).
    Order { position: usize },
    /// Same record, different watched field.
    Field { id: String },
}

/// Find the first significant difference, if any.
pub fn first_difference<T: Record>(old: &[T], new: &[T]) -> Option<Difference> {
    if old.len() != new.len() {
        return Some(Difference::Length {
            old: old.len(),
            new: new.len(),
        });
    }

    if let Some(position) = old
        .iter()
        .zip(new)
        .position(|(a, b)| a.id() != b.id())
    {
        return Some(Difference::Order { position });
    }

    old.iter()
        .zip(new)
        .find(|(a, b)| !a.watched_eq(b))
        .map(|(_, b)| Difference::Field {
            id: b.id().to_string(),
        })
}

/// Whether `new` must replace `old`.
pub fn changed<T: Record>(old: &[T], new: &[T]) -> bool {
    first_difference(old, new).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Driver, DriverStatus, Order, OrderStatus};

    fn order(id: &str, status: OrderStatus) -> Order {
        Order {
            id: id.to_string(),
            status,
            assigned_driver_id: None,
            location_id: Some("L1".into()),
            customer_name: None,
            created_at: Some("2024-05-01T10:00:00Z".into()),
            updated_at: None,
            driver: None,
        }
    }

    #[test]
    fn test_identical_lists_unchanged() {
        let list = vec![order("a", OrderStatus::Pending), order("b", OrderStatus::Ready)];
        assert!(!changed(&list, &list));
        assert!(!changed::<Order>(&[], &[]));
    }

    #[test]
    fn test_status_change_detected() {
        let old = vec![order("a", OrderStatus::Accepted)];
        let new = vec![order("a", OrderStatus::Confirmed)];
        assert_eq!(
            first_difference(&old, &new),
            Some(Difference::Field { id: "a".into() })
        );
    }

    #[test]
    fn test_driver_assignment_detected() {
        let old = vec![order("a", OrderStatus::Ready)];
        let mut new = old.clone();
        new[0].assigned_driver_id = Some("d1".into());
        assert!(changed(&old, &new));
    }

    #[test]
    fn test_timestamp_change_ignored() {
        let old = vec![order("a", OrderStatus::Accepted)];
        let mut new = old.clone();
        new[0].updated_at = Some("2024-05-01T10:05:00Z".into());
        new[0].customer_name = Some("Alex".into());
        assert!(!changed(&old, &new));
    }

    #[test]
    fn test_membership_and_order() {
        let old = vec![order("a", OrderStatus::Pending), order("b", OrderStatus::Pending)];
        let added = vec![
            order("a", OrderStatus::Pending),
            order("b", OrderStatus::Pending),
            order("c", OrderStatus::Pending),
        ];
        assert_eq!(
            first_difference(&old, &added),
            Some(Difference::Length { old: 2, new: 3 })
        );

        let reordered = vec![order("b", OrderStatus::Pending), order("a", OrderStatus::Pending)];
        assert_eq!(
            first_difference(&old, &reordered),
            Some(Difference::Order { position: 0 })
        );
    }

    #[test]
    fn test_driver_status() {
        let old = vec![Driver {
            id: "d1".into(),
            status: DriverStatus::Available,
            name: Some("Sam".into()),
            location_id: None,
            phone: None,
            updated_at: None,
        }];
        let mut renamed = old.clone();
        renamed[0].name = Some("Samuel".into());
        assert!(!changed(&old, &renamed));

        let mut busy = old.clone();
        busy[0].status = DriverStatus::Busy;
        assert!(changed(&old, &busy));
    }
}
