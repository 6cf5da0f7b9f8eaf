//! In-memory remote store and push provider.
//!
//! [`MemoryBackend`] implements both [`DataSource`] and [`ChannelProvider`]
//! over plain JSON rows. Mutations publish change events to every open
//! channel whose table and filter match, the way a hosted realtime backend
//! would. Faults (dead push, broken channels, failing or slow fetches) can
//! be injected for tests and demos.

use crate::channel::{
    ChannelEvent, ChannelProvider, ChannelSignal, ChannelSink, ChannelSpec, ChannelStatus, PushChannel,
};
use crate::error::{Result, SyncError};
use crate::source::DataSource;
use crate::types::{EntityKind, Filter};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// How the simulated push service behaves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PushMode {
    /// Channels report `subscribed`, echo heartbeats and deliver events.
    #[default]
    Live,
    /// Channels open but never deliver anything.
    Silent,
    /// Opening a channel fails.
    Refuse,
}

struct OpenChannel {
    id: u64,
    spec: ChannelSpec,
    sink: ChannelSink,
    closed: AtomicBool,
}

struct BackendInner {
    tables: Mutex<HashMap<EntityKind, Vec<Value>>>,
    channels: Mutex<Vec<Arc<OpenChannel>>>,
    push_mode: Mutex<PushMode>,
    fetch_delay: Mutex<Duration>,
    fetch_failure: Mutex<Option<String>>,
    next_channel: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,
    fetches: AtomicUsize,
}

impl BackendInner {
    fn push_mode(&self) -> PushMode {
        *self.push_mode.lock()
    }

    /// Sinks of open channels selected by `pick`, collected so no lock is
    /// held while delivering.
    fn sinks_where<F>(&self, pick: F) -> Vec<ChannelSink>
    where
        F: Fn(&OpenChannel) -> bool,
    {
        self.channels
            .lock()
            .iter()
            .filter(|ch| !ch.closed.load(Ordering::SeqCst) && pick(ch))
            .map(|ch| ch.sink.clone())
            .collect()
    }
}

/// Simulated remote backend with push support.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BackendInner {
                tables: Mutex::new(HashMap::new()),
                channels: Mutex::new(Vec::new()),
                push_mode: Mutex::new(PushMode::Live),
                fetch_delay: Mutex::new(Duration::ZERO),
                fetch_failure: Mutex::new(None),
                next_channel: AtomicU64::new(1),
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                fetches: AtomicUsize::new(0),
            }),
        }
    }

    // --- Data ---

    /// Replace a table's rows without publishing events.
    pub fn seed(&self, kind: EntityKind, rows: Vec<Value>) {
        self.inner.tables.lock().insert(kind, rows);
    }

    pub fn rows(&self, kind: EntityKind) -> Vec<Value> {
        self.inner.tables.lock().get(&kind).cloned().unwrap_or_default()
    }

    /// Append a row and publish an insert.
    pub fn insert(&self, kind: EntityKind, row: Value) {
        self.inner
            .tables
            .lock()
            .entry(kind)
            .or_default()
            .push(row.clone());
        self.emit(ChannelEvent::insert(kind.table(), row));
    }

    /// Merge `patch` into the row with `id` and publish an update.
    ///
    /// Returns false if no such row exists.
    pub fn update(&self, kind: EntityKind, id: &str, patch: Value) -> bool {
        let change = {
            let mut tables = self.inner.tables.lock();
            let Some(row) = tables
                .get_mut(&kind)
                .and_then(|rows| rows.iter_mut().find(|r| r["id"] == id))
            else {
                return false;
            };
            let old = row.clone();
            if let (Some(target), Value::Object(fields)) = (row.as_object_mut(), patch) {
                for (column, value) in fields {
                    target.insert(column, value);
                }
            }
            (old, row.clone())
        };
        self.emit(ChannelEvent::update(kind.table(), change.0, change.1));
        true
    }

    /// Remove the row with `id` and publish a delete.
    pub fn delete(&self, kind: EntityKind, id: &str) -> bool {
        let removed = {
            let mut tables = self.inner.tables.lock();
            let rows = tables.entry(kind).or_default();
            rows.iter()
                .position(|r| r["id"] == id)
                .map(|pos| rows.remove(pos))
        };
        match removed {
            Some(old) => {
                self.emit(ChannelEvent::delete(kind.table(), old));
                true
            }
            None => false,
        }
    }

    // --- Push ---

    /// Deliver a change to every matching open channel. Dropped unless live.
    pub fn emit(&self, event: ChannelEvent) {
        if self.inner.push_mode() != PushMode::Live {
            return;
        }
        let sinks = self
            .inner
            .sinks_where(|ch| ch.spec.table == event.table && event.touches(&ch.spec.filter));
        for sink in sinks {
            sink.send(ChannelSignal::Change(event.clone()));
        }
    }

    /// Report an error on every open channel of `table`.
    pub fn break_channels(&self, table: &str, message: &str) {
        let sinks = self.inner.sinks_where(|ch| ch.spec.table == table);
        for sink in sinks {
            sink.send(ChannelSignal::Status(ChannelStatus::Error(message.to_string())));
        }
    }

    pub fn set_push_mode(&self, mode: PushMode) {
        *self.inner.push_mode.lock() = mode;
    }

    // --- Fetch faults ---

    /// Delay applied to fetches started from now on.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.inner.fetch_delay.lock() = delay;
    }

    /// Make fetches fail with `message` until [`restore_fetches`](Self::restore_fetches).
    pub fn fail_fetches(&self, message: impl Into<String>) {
        *self.inner.fetch_failure.lock() = Some(message.into());
    }

    pub fn restore_fetches(&self) {
        *self.inner.fetch_failure.lock() = None;
    }

    // --- Counters ---

    /// Channels opened so far.
    pub fn opened_channels(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// `close()` calls received so far.
    pub fn closed_channels(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Topics of channels currently open.
    pub fn open_topics(&self) -> Vec<String> {
        self.inner
            .channels
            .lock()
            .iter()
            .filter(|ch| !ch.closed.load(Ordering::SeqCst))
            .map(|ch| ch.spec.topic.clone())
            .collect()
    }

    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSource for MemoryBackend {
    async fn fetch_all(&self, kind: EntityKind, filter: &Filter) -> Result<Vec<Value>> {
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.inner.fetch_delay.lock();
        let failure = self.inner.fetch_failure.lock().clone();

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = failure {
            return Err(SyncError::fetch(kind, message));
        }

        Ok(self
            .rows(kind)
            .into_iter()
            .filter(|row| filter.matches(row))
            .collect())
    }
}

struct MemoryChannel {
    channel: Arc<OpenChannel>,
    backend: Weak<BackendInner>,
}

impl PushChannel for MemoryChannel {
    fn send_heartbeat(&self) -> Result<()> {
        let Some(backend) = self.backend.upgrade() else {
            return Err(SyncError::channel(&self.channel.spec.topic, "backend gone"));
        };
        if backend.push_mode() == PushMode::Live && !self.channel.closed.load(Ordering::SeqCst) {
            self.channel.sink.send(ChannelSignal::Heartbeat);
        }
        Ok(())
    }

    fn close(&self) {
        self.channel.closed.store(true, Ordering::SeqCst);
        if let Some(backend) = self.backend.upgrade() {
            backend.closed.fetch_add(1, Ordering::SeqCst);
            backend.channels.lock().retain(|ch| ch.id != self.channel.id);
        }
    }
}

impl ChannelProvider for MemoryBackend {
    fn open_channel(&self, spec: &ChannelSpec, sink: ChannelSink) -> Result<Box<dyn PushChannel>> {
        let mode = self.inner.push_mode();
        if mode == PushMode::Refuse {
            return Err(SyncError::channel(&spec.topic, "push service unavailable"));
        }

        let channel = Arc::new(OpenChannel {
            id: self.inner.next_channel.fetch_add(1, Ordering::SeqCst),
            spec: spec.clone(),
            sink,
            closed: AtomicBool::new(false),
        });
        self.inner.channels.lock().push(Arc::clone(&channel));
        self.inner.opened.fetch_add(1, Ordering::SeqCst);

        if mode == PushMode::Live {
            channel.sink.send(ChannelSignal::Status(ChannelStatus::Subscribed));
        }

        Ok(Box::new(MemoryChannel {
            channel,
            backend: Arc::downgrade(&self.inner),
        }))
    }
}
