//! Core types shared by the registry, the detector and the controllers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// The kinds of remote tables a consumer can synchronize.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Orders,
    Drivers,
    Staff,
}

impl EntityKind {
    /// Remote table backing this kind.
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Orders => "orders",
            EntityKind::Drivers => "drivers",
            EntityKind::Staff => "staff",
        }
    }

    /// Look up a kind by its table name.
    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            "orders" => Some(EntityKind::Orders),
            "drivers" => Some(EntityKind::Drivers),
            "staff" => Some(EntityKind::Staff),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Equality filter over record columns.
///
/// Backed by an ordered map, so two filters built from the same pairs in a
/// different order are equal and serialize identically.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter(BTreeMap<String, String>);

impl Filter {
    /// Filter matching every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter with a single `column = value` condition.
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::default().and(column, value)
    }

    /// Add a condition. A later value for the same column replaces the earlier one.
    pub fn and(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Conditions in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    /// Whether a JSON row satisfies every condition.
    ///
    /// Non-string columns are compared through their JSON rendering, so
    /// `{"seats": 4}` matches `seats = "4"`. Missing and null columns never match.
    pub fn matches(&self, row: &Value) -> bool {
        self.0.iter().all(|(column, expected)| match row.get(column) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => s == expected,
            Some(other) => other.to_string() == *expected,
        })
    }

    /// Provider-side filter expression, e.g. `locationId=eq.L1,status=eq.ready`.
    pub fn expression(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(column, value)| format!("{}=eq.{}", column, value))
            .collect();
        Some(parts.join(","))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Filter {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Filter(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Lamport-style ordering token for snapshot updates.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SequenceToken(pub u64);

impl SequenceToken {
    pub fn next(self) -> Self {
        SequenceToken(self.0 + 1)
    }
}

impl fmt::Debug for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health of the push path as seen by one controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Unknown,
    Probing,
    ConfirmedLive,
    DegradedFallback,
}

impl ConnectionState {
    /// Whether moving to `next` is allowed.
    ///
    /// States only move forward, except that a live channel may degrade.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Unknown, _) => true,
            (Probing, ConfirmedLive | DegradedFallback) => true,
            (ConfirmedLive, DegradedFallback) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Probing => "probing",
            ConnectionState::ConfirmedLive => "confirmed-live",
            ConnectionState::DegradedFallback => "degraded-fallback",
        };
        f.write_str(s)
    }
}

/// Immutable, ordered list of records as last accepted by a controller.
///
/// Cloning is cheap. Updates replace the whole snapshot.
pub struct Snapshot<T> {
    records: Arc<Vec<T>>,
    sequence: SequenceToken,
}

impl<T> Snapshot<T> {
    pub fn new(records: Vec<T>, sequence: SequenceToken) -> Self {
        Self {
            records: Arc::new(records),
            sequence,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), SequenceToken::default())
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    /// Token this snapshot was accepted at.
    pub fn sequence(&self) -> SequenceToken {
        self.sequence
    }
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            sequence: self.sequence,
        }
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.records
    }
}

impl<T: fmt::Debug> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("sequence", &self.sequence)
            .field("records", &self.records)
            .finish()
    }
}
