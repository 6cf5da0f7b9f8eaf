//! Push channel provider interface.
//!
//! A provider opens long-lived channels that deliver row-level change
//! events for one table (optionally filtered) plus lifecycle statuses.
//! Signals are pushed into a [`ChannelSink`] supplied at open time; the
//! provider may call it from any thread, including from inside
//! [`ChannelProvider::open_channel`].

use crate::error::Result;
use crate::types::Filter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

/// One row-level change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEvent {
    pub event_type: EventType,
    pub table: String,
    #[serde(default)]
    pub new_record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
}

impl ChannelEvent {
    pub fn insert(table: impl Into<String>, record: Value) -> Self {
        Self {
            event_type: EventType::Insert,
            table: table.into(),
            new_record: Some(record),
            old_record: None,
        }
    }

    pub fn update(table: impl Into<String>, old: Value, new: Value) -> Self {
        Self {
            event_type: EventType::Update,
            table: table.into(),
            new_record: Some(new),
            old_record: Some(old),
        }
    }

    pub fn delete(table: impl Into<String>, old: Value) -> Self {
        Self {
            event_type: EventType::Delete,
            table: table.into(),
            new_record: None,
            old_record: Some(old),
        }
    }

    /// Whether either side of the change satisfies `filter`.
    pub fn touches(&self, filter: &Filter) -> bool {
        self.new_record.as_ref().is_some_and(|r| filter.matches(r))
            || self.old_record.as_ref().is_some_and(|r| filter.matches(r))
    }
}

/// Channel lifecycle status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Subscribed,
    Error(String),
    Closed,
}

impl ChannelStatus {
    /// Whether the channel can no longer deliver events.
    pub fn is_failure(&self) -> bool {
        matches!(self, ChannelStatus::Error(_) | ChannelStatus::Closed)
    }
}

/// Anything a channel reports.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelSignal {
    Change(ChannelEvent),
    Status(ChannelStatus),
    /// Echo of a heartbeat sent with [`PushChannel::send_heartbeat`].
    Heartbeat,
}

/// What to open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Provider-facing channel name.
    pub topic: String,
    pub table: String,
    pub filter: Filter,
}

impl ChannelSpec {
    pub fn new(topic: impl Into<String>, table: impl Into<String>, filter: Filter) -> Self {
        Self {
            topic: topic.into(),
            table: table.into(),
            filter,
        }
    }
}

/// Receiving end a provider pushes signals into.
#[derive(Clone)]
pub struct ChannelSink {
    deliver: Arc<dyn Fn(ChannelSignal) + Send + Sync>,
}

impl ChannelSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(ChannelSignal) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn send(&self, signal: ChannelSignal) {
        (self.deliver)(signal)
    }
}

impl fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelSink")
    }
}

/// One open physical channel.
pub trait PushChannel: Send + Sync {
    /// Ask the provider to echo a [`ChannelSignal::Heartbeat`].
    fn send_heartbeat(&self) -> Result<()>;

    /// Stop delivery. Called at most once by this crate.
    fn close(&self);
}

/// Opens physical channels.
pub trait ChannelProvider: Send + Sync {
    fn open_channel(&self, spec: &ChannelSpec, sink: ChannelSink) -> Result<Box<dyn PushChannel>>;
}
