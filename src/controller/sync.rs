//! Per-consumer synchronization controller.

use crate::channel::{ChannelSignal, EventType};
use crate::detect::first_difference;
use crate::entities::{decode_rows, Record};
use crate::error::{Result, SyncError};
use crate::poller::{ActiveCheck, FallbackPoller, Tick};
use crate::probe::ConnectionProbe;
use crate::source::SharedDataSource;
use crate::subscriptions::{SubscriptionGuard, SubscriptionRegistry};
use crate::types::{ConnectionState, Filter, SequenceToken, Snapshot};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::types::{ChangeReceiver, FetchOutcome, Phase, SyncConfig, SyncEvent, SyncOptions};

/// Mutable controller state, guarded by one lock.
struct State<T> {
    snapshot: Snapshot<T>,
    /// Whether any fetch result or optimistic update has been accepted.
    accepted_once: bool,
    loading: bool,
    error: Option<String>,
    phase: Phase,
    connection: ConnectionState,
    /// Shared counter for optimistic updates and accepted fetches.
    counter: SequenceToken,
    /// Counter value of the latest optimistic update.
    last_optimistic: SequenceToken,
    /// Issue order of fetches.
    next_ticket: u64,
    /// Newest ticket whose result has been reconciled.
    newest_resolved: Option<u64>,
    subscription: Option<SubscriptionGuard>,
}

impl<T> State<T> {
    /// Move to `phase`, returning the connection event to publish, if any.
    /// Teardown is final.
    fn enter(&mut self, phase: Phase) -> Option<SyncEvent> {
        if self.phase == Phase::Teardown {
            return None;
        }
        self.phase = phase;
        let next = phase.connection_state()?;
        if next == self.connection {
            return None;
        }
        debug_assert!(self.connection.can_transition_to(next));
        self.connection = next;
        Some(SyncEvent::ConnectionChanged(next))
    }
}

struct ControllerInner<T: Record> {
    filter: Filter,
    source: SharedDataSource,
    registry: Arc<SubscriptionRegistry>,
    probe: ConnectionProbe,
    config: SyncConfig,
    options: SyncOptions<T>,
    runtime: Handle,
    /// Cleared on teardown; in-flight work checks it before touching state.
    alive: AtomicBool,
    state: Mutex<State<T>>,
    poller: FallbackPoller,
    safety_net: FallbackPoller,
    lifecycle: Mutex<Option<JoinHandle<()>>>,
    watchers: Mutex<Vec<Sender<SyncEvent>>>,
}

impl<T: Record> ControllerInner<T> {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// INIT -> PROBING -> REALTIME | POLLING.
    async fn run(self: Arc<Self>) {
        if let Err(e) = self.fetch_and_reconcile().await {
            tracing::debug!(kind = %T::KIND, error = %e, "initial fetch did not complete");
        }
        if !self.is_alive() {
            return;
        }

        self.transition(Phase::Probing);
        let live = self.probe.test().await;
        if !self.is_alive() {
            return;
        }

        if live && self.enter_realtime() {
            return;
        }
        self.enter_polling();
    }

    fn transition(&self, phase: Phase) {
        let event = self.state.lock().enter(phase);
        tracing::debug!(kind = %T::KIND, filter = ?self.filter, phase = ?phase, "controller phase");
        self.notify(event);
    }

    /// Register with the registry. Returns false if the subscription failed.
    fn enter_realtime(self: &Arc<Self>) -> bool {
        self.transition(Phase::Realtime);

        let weak = Arc::downgrade(self);
        let subscribed = self.registry.subscribe(T::KIND, &self.filter, move |signal| {
            if let Some(inner) = weak.upgrade() {
                inner.on_signal(signal);
            }
        });

        let guard = match subscribed {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(kind = %T::KIND, error = %e, "subscribe failed, falling back to polling");
                return false;
            }
        };

        // A channel error during subscribe may already have moved us on.
        let rejected = {
            let mut state = self.state.lock();
            if self.is_alive() && state.phase == Phase::Realtime {
                state.subscription = Some(guard);
                None
            } else {
                Some(guard)
            }
        };
        if let Some(guard) = rejected {
            drop(guard);
            return true;
        }

        if let Some(interval) = self.config.background_refresh {
            self.safety_net.start(interval, self.active_check(), self.fetch_tick());
            if !self.is_alive() {
                self.safety_net.stop();
            }
        }
        true
    }

    fn enter_polling(self: &Arc<Self>) {
        self.transition(Phase::Polling);
        self.poller
            .start(self.config.poll_interval, self.active_check(), self.fetch_tick());
        if !self.is_alive() {
            self.poller.stop();
        }
    }

    /// REALTIME -> POLLING after a channel failure.
    fn fall_back(self: &Arc<Self>) {
        let (guard, event) = {
            let mut state = self.state.lock();
            if state.phase != Phase::Realtime {
                return;
            }
            let event = state.enter(Phase::Polling);
            (state.subscription.take(), event)
        };
        // Unsubscribe outside the state lock; closing may signal synchronously.
        drop(guard);
        self.notify(event);
        self.safety_net.stop();
        self.poller
            .start(self.config.poll_interval, self.active_check(), self.fetch_tick());
        if !self.is_alive() {
            self.poller.stop();
        }
    }

    fn on_signal(self: &Arc<Self>, signal: &ChannelSignal) {
        if !self.is_alive() {
            return;
        }
        match signal {
            ChannelSignal::Change(event) => {
                if event.event_type == EventType::Insert {
                    if let (Some(hook), Some(row)) = (&self.options.on_new_record, &event.new_record) {
                        match T::decode(row.clone()) {
                            Ok(record) => {
                                if catch_unwind(AssertUnwindSafe(|| hook(&record))).is_err() {
                                    tracing::error!(kind = %T::KIND, id = record.id(), "new record hook panicked");
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "ignoring undecodable inserted record"),
                        }
                    }
                }
                self.spawn_fetch();
            }
            ChannelSignal::Status(status) if status.is_failure() => {
                tracing::warn!(kind = %T::KIND, status = ?status, "channel failed, switching to polling");
                self.fall_back();
            }
            ChannelSignal::Status(_) | ChannelSignal::Heartbeat => {}
        }
    }

    fn active_check(&self) -> ActiveCheck {
        if let Some(check) = &self.options.active_check {
            return Arc::clone(check);
        }
        Arc::new(|| true)
    }

    fn fetch_tick(self: &Arc<Self>) -> Tick {
        let weak = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.spawn_fetch();
            }
        })
    }

    fn spawn_fetch(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let _ = inner.fetch_and_reconcile().await;
        });
    }

    /// Fetch and apply the result if it is still relevant.
    async fn fetch_and_reconcile(&self) -> Result<FetchOutcome> {
        let (started, ticket) = {
            let mut state = self.state.lock();
            if !self.is_alive() {
                return Err(SyncError::TornDown);
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            (state.counter, ticket)
        };

        let fetched = self
            .source
            .fetch_all(T::KIND, &self.filter)
            .await
            .and_then(decode_rows::<T>);

        let mut events = Vec::new();
        let outcome = {
            let mut state = self.state.lock();
            if !self.is_alive() {
                return Err(SyncError::TornDown);
            }

            if state.loading {
                state.loading = false;
                events.push(SyncEvent::LoadingChanged(false));
            }

            match fetched {
                Err(e) => {
                    let message = e.to_string();
                    tracing::warn!(kind = %T::KIND, error = %message, "fetch failed");
                    if e.is_user_visible() && state.error.as_deref() != Some(message.as_str()) {
                        state.error = Some(message.clone());
                        events.push(SyncEvent::ErrorChanged(Some(message)));
                    }
                    Err(e)
                }
                Ok(records) => {
                    if state.error.take().is_some() {
                        events.push(SyncEvent::ErrorChanged(None));
                    }
                    Ok(self.reconcile(&mut state, records, started, ticket, &mut events))
                }
            }
        };

        self.notify_all(events);
        outcome
    }

    fn reconcile(
        &self,
        state: &mut State<T>,
        records: Vec<T>,
        started: SequenceToken,
        ticket: u64,
        events: &mut Vec<SyncEvent>,
    ) -> FetchOutcome {
        if state.last_optimistic > started {
            tracing::trace!(kind = %T::KIND, started = ?started, optimistic = ?state.last_optimistic, "discarding fetch older than optimistic update");
            return FetchOutcome::Superseded;
        }
        if state.newest_resolved.is_some_and(|newest| ticket < newest) {
            tracing::trace!(kind = %T::KIND, ticket, "discarding out-of-order fetch");
            return FetchOutcome::Superseded;
        }
        state.newest_resolved = Some(ticket);

        if state.accepted_once {
            match first_difference(state.snapshot.records(), &records) {
                None => return FetchOutcome::Unchanged,
                Some(difference) => {
                    tracing::debug!(kind = %T::KIND, difference = ?difference, "snapshot changed");
                }
            }
        }

        state.counter = state.counter.next();
        state.snapshot = Snapshot::new(records, state.counter);
        state.accepted_once = true;
        events.push(SyncEvent::SnapshotChanged {
            sequence: state.counter,
        });
        FetchOutcome::Accepted(state.counter)
    }

    fn notify(&self, event: Option<SyncEvent>) {
        if let Some(event) = event {
            self.notify_all(vec![event]);
        }
    }

    /// Deliver to every watcher. Full buffers skip the event; disconnected
    /// watchers are dropped.
    fn notify_all(&self, events: Vec<SyncEvent>) {
        if events.is_empty() {
            return;
        }
        let mut watchers = self.watchers.lock();
        watchers.retain(|watcher| {
            for event in &events {
                match watcher.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::trace!("watcher buffer full, skipping event");
                    }
                    Err(TrySendError::Disconnected(_)) => return false,
                }
            }
            true
        });
    }

    fn teardown(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let guard = {
            let mut state = self.state.lock();
            state.enter(Phase::Teardown);
            state.subscription.take()
        };
        drop(guard);
        self.poller.stop();
        self.safety_net.stop();
        self.probe.cancel();
        if let Some(task) = self.lifecycle.lock().take() {
            task.abort();
        }
        self.notify_all(vec![SyncEvent::TornDown]);
        self.watchers.lock().clear();
        tracing::debug!(kind = %T::KIND, filter = ?self.filter, "controller torn down");
    }
}

/// Keeps one consumer's view of `(T::KIND, filter)` in sync with the remote
/// source.
///
/// Starts with a fetch, probes the push path, then either listens through
/// the [`SubscriptionRegistry`] or polls. Every fetch result passes the
/// sequence guard and the change detector before it replaces the snapshot.
///
/// Dropping the controller tears it down.
pub struct SyncController<T: Record> {
    inner: Arc<ControllerInner<T>>,
}

impl<T: Record> SyncController<T> {
    /// Create and start a controller. Must be called inside a Tokio runtime.
    pub fn start(
        registry: Arc<SubscriptionRegistry>,
        source: SharedDataSource,
        filter: Filter,
        options: SyncOptions<T>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| SyncError::Config("SyncController requires a Tokio runtime".into()))?;

        let probe = ConnectionProbe::for_subscription(
            registry.provider(),
            T::KIND,
            &filter,
            &config.probe_scope,
            config.probe_timeout,
        );

        let inner = Arc::new(ControllerInner {
            filter,
            source,
            registry,
            probe,
            config,
            options,
            runtime: runtime.clone(),
            alive: AtomicBool::new(true),
            state: Mutex::new(State {
                snapshot: Snapshot::empty(),
                accepted_once: false,
                loading: true,
                error: None,
                phase: Phase::Init,
                connection: ConnectionState::Unknown,
                counter: SequenceToken::default(),
                last_optimistic: SequenceToken::default(),
                next_ticket: 0,
                newest_resolved: None,
                subscription: None,
            }),
            poller: FallbackPoller::with_runtime(runtime.clone()),
            safety_net: FallbackPoller::with_runtime(runtime),
            lifecycle: Mutex::new(None),
            watchers: Mutex::new(Vec::new()),
        });

        let task = inner.runtime.spawn(Arc::clone(&inner).run());
        *inner.lifecycle.lock() = Some(task);
        tracing::debug!(kind = %T::KIND, filter = ?inner.filter, "controller started");

        Ok(Self { inner })
    }

    /// Latest accepted snapshot.
    pub fn snapshot(&self) -> Snapshot<T> {
        self.inner.state.lock().snapshot.clone()
    }

    /// True until the initial fetch resolves.
    pub fn is_loading(&self) -> bool {
        self.inner.state.lock().loading
    }

    /// Message of the last failed fetch, cleared by the next successful one.
    pub fn error(&self) -> Option<String> {
        self.inner.state.lock().error.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    pub fn filter(&self) -> &Filter {
        &self.inner.filter
    }

    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    /// Replace the snapshot with `transform(current)` right away.
    ///
    /// Bumps the sequence token, so fetches started before this call can no
    /// longer overwrite the result. `transform` runs under the controller's
    /// lock and must not call back into the controller.
    ///
    /// Returns the new token, or None if the controller was torn down.
    pub fn optimistic_update<F>(&self, transform: F) -> Option<SequenceToken>
    where
        F: FnOnce(&[T]) -> Vec<T>,
    {
        let sequence = {
            let mut state = self.inner.state.lock();
            if !self.inner.is_alive() {
                return None;
            }
            let records = transform(state.snapshot.records());
            state.counter = state.counter.next();
            state.last_optimistic = state.counter;
            state.snapshot = Snapshot::new(records, state.counter);
            state.accepted_once = true;
            state.counter
        };
        tracing::debug!(kind = %T::KIND, sequence = ?sequence, "optimistic update applied");
        self.inner
            .notify(Some(SyncEvent::SnapshotChanged { sequence }));
        Some(sequence)
    }

    /// Fetch now, under the same rules as scheduled fetches.
    pub async fn refetch(&self) -> Result<FetchOutcome> {
        self.inner.fetch_and_reconcile().await
    }

    /// Subscribe to change notifications.
    pub fn watch(&self) -> ChangeReceiver {
        let (sender, receiver) = bounded(self.inner.config.watch_buffer);
        if self.inner.is_alive() {
            self.inner.watchers.lock().push(sender);
        }
        ChangeReceiver { receiver }
    }

    /// Stop listening and polling. In-flight fetches become no-ops.
    pub fn teardown(&self) {
        self.inner.teardown();
    }

    /// Tear down and start a new controller for `filter` with the same
    /// registry, source, options and config.
    pub fn rebind(self, filter: Filter) -> Result<Self> {
        self.teardown();
        let inner = &self.inner;
        Self::start(
            Arc::clone(&inner.registry),
            Arc::clone(&inner.source),
            filter,
            inner.options.clone(),
            inner.config.clone(),
        )
    }
}

impl<T: Record> Drop for SyncController<T> {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}
