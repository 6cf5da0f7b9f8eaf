//! Configuration, options and notifications for sync controllers.

use crate::error::{Result, SyncError};
use crate::poller::{ActiveCheck, POLL_INTERVAL_DEGRADED, POLL_INTERVAL_SAFETY_NET};
use crate::probe::{ProbeScope, PROBE_TIMEOUT};
use crate::types::{ConnectionState, SequenceToken};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Controller configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a probe waits for the push path to prove itself.
    /// Default: 3s
    pub probe_timeout: Duration,

    /// Poll cadence once push is considered unavailable.
    /// Default: 3s
    pub poll_interval: Duration,

    /// Extra safety-net refresh while push is live (None = off).
    /// See [`with_safety_net`](Self::with_safety_net).
    pub background_refresh: Option<Duration>,

    /// Max buffered notifications per watcher before events are skipped.
    /// Default: 64
    pub watch_buffer: usize,

    /// Which channel the probe opens.
    pub probe_scope: ProbeScope,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            probe_timeout: PROBE_TIMEOUT,
            poll_interval: POLL_INTERVAL_DEGRADED,
            background_refresh: None,
            watch_buffer: 64,
            probe_scope: ProbeScope::Subscription,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `LIVESYNC_PROBE_TIMEOUT_MS`,
    /// `LIVESYNC_POLL_INTERVAL_MS` and `LIVESYNC_BACKGROUND_REFRESH_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_millis("LIVESYNC_PROBE_TIMEOUT_MS") {
            config.probe_timeout = ms;
        }
        if let Some(ms) = env_millis("LIVESYNC_POLL_INTERVAL_MS") {
            config.poll_interval = ms;
        }
        if let Some(ms) = env_millis("LIVESYNC_BACKGROUND_REFRESH_MS") {
            config.background_refresh = Some(ms);
        }
        config
    }

    /// Refresh every [`POLL_INTERVAL_SAFETY_NET`] even while push is live.
    pub fn with_safety_net(mut self) -> Self {
        self.background_refresh = Some(POLL_INTERVAL_SAFETY_NET);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.probe_timeout.is_zero() {
            return Err(SyncError::Config("probe_timeout must be positive".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(SyncError::Config("poll_interval must be positive".into()));
        }
        if self.background_refresh.is_some_and(|d| d.is_zero()) {
            return Err(SyncError::Config("background_refresh must be positive".into()));
        }
        if self.watch_buffer == 0 {
            return Err(SyncError::Config("watch_buffer must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring non-numeric duration");
            None
        }
    }
}

/// Hook called with each record announced by an insert event.
pub type NewRecordHook<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Per-consumer hooks.
pub struct SyncOptions<T> {
    /// Called once per insert event, before the re-fetch.
    pub on_new_record: Option<NewRecordHook<T>>,
    /// Polls only fire while this returns true (None = always active).
    pub active_check: Option<ActiveCheck>,
}

impl<T> SyncOptions<T> {
    pub fn new() -> Self {
        Self {
            on_new_record: None,
            active_check: None,
        }
    }

    pub fn on_new_record<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_new_record = Some(Arc::new(hook));
        self
    }

    pub fn active_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.active_check = Some(Arc::new(check));
        self
    }
}

impl<T> Default for SyncOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for SyncOptions<T> {
    fn clone(&self) -> Self {
        Self {
            on_new_record: self.on_new_record.clone(),
            active_check: self.active_check.clone(),
        }
    }
}

impl<T> fmt::Debug for SyncOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("on_new_record", &self.on_new_record.is_some())
            .field("active_check", &self.active_check.is_some())
            .finish()
    }
}

/// Where a controller is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    Probing,
    Realtime,
    Polling,
    Teardown,
}

impl Phase {
    /// Connection state implied by entering this phase (None = unchanged).
    pub(crate) fn connection_state(self) -> Option<ConnectionState> {
        match self {
            Phase::Init => Some(ConnectionState::Unknown),
            Phase::Probing => Some(ConnectionState::Probing),
            Phase::Realtime => Some(ConnectionState::ConfirmedLive),
            Phase::Polling => Some(ConnectionState::DegradedFallback),
            Phase::Teardown => None,
        }
    }
}

/// Notification sent to watchers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    SnapshotChanged { sequence: SequenceToken },
    LoadingChanged(bool),
    ErrorChanged(Option<String>),
    ConnectionChanged(ConnectionState),
    TornDown,
}

/// What happened to one fetch result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Became the new snapshot.
    Accepted(SequenceToken),
    /// Same as the current snapshot for every watched field.
    Unchanged,
    /// A newer optimistic update or fetch result won.
    Superseded,
}

/// Receiving side of [`SyncController::watch`](super::SyncController::watch).
pub struct ChangeReceiver {
    pub(crate) receiver: crossbeam_channel::Receiver<SyncEvent>,
}

impl ChangeReceiver {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> std::result::Result<SyncEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<SyncEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<SyncEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything queued right now.
    pub fn drain(&self) -> Vec<SyncEvent> {
        self.receiver.try_iter().collect()
    }
}
