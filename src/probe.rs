//! One-shot end-to-end test of the push path.
//!
//! A probe opens a throwaway channel, waits for the provider to confirm the
//! subscription, then asks for a heartbeat echo. Any change event or the
//! echo within the window means push is live. Timeouts, channel errors and
//! open failures mean it is not. The throwaway channel is always closed.

use crate::channel::{ChannelProvider, ChannelSignal, ChannelSink, ChannelSpec, ChannelStatus, PushChannel};
use crate::types::{EntityKind, Filter};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default probe window.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Which channel a probe opens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "table")]
pub enum ProbeScope {
    /// The controller's own table and filter.
    #[default]
    Subscription,
    /// A fixed, usually low-traffic table with no filter.
    Table(String),
}

/// Tests whether a push channel delivers end to end.
///
/// Concurrent calls to [`test`](Self::test) share one in-flight probe.
pub struct ConnectionProbe {
    provider: Arc<dyn ChannelProvider>,
    spec: ChannelSpec,
    timeout: Duration,
    in_flight: Mutex<Option<Shared<BoxFuture<'static, bool>>>>,
}

impl ConnectionProbe {
    pub fn new(provider: Arc<dyn ChannelProvider>, spec: ChannelSpec, timeout: Duration) -> Self {
        Self {
            provider,
            spec,
            timeout,
            in_flight: Mutex::new(None),
        }
    }

    /// Probe scoped per `scope` for a subscription on `(kind, filter)`.
    pub fn for_subscription(
        provider: Arc<dyn ChannelProvider>,
        kind: EntityKind,
        filter: &Filter,
        scope: &ProbeScope,
        timeout: Duration,
    ) -> Self {
        let spec = match scope {
            ProbeScope::Subscription => ChannelSpec::new(
                format!("probe-{}", kind.table()),
                kind.table(),
                filter.clone(),
            ),
            ProbeScope::Table(table) => {
                ChannelSpec::new(format!("probe-{}", table), table.clone(), Filter::all())
            }
        };
        Self::new(provider, spec, timeout)
    }

    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    /// Run the probe, or join the one already running.
    pub fn test(&self) -> impl std::future::Future<Output = bool> + Send + 'static {
        let mut in_flight = self.in_flight.lock();
        if let Some(running) = in_flight.as_ref() {
            if running.peek().is_none() {
                return running.clone();
            }
        }

        let provider = Arc::clone(&self.provider);
        let spec = self.spec.clone();
        let timeout = self.timeout;
        let probe = run_probe(provider, spec, timeout).boxed().shared();
        *in_flight = Some(probe.clone());
        probe
    }

    /// Forget the in-flight probe. Once no caller awaits it any more, its
    /// channel is closed.
    pub fn cancel(&self) {
        self.in_flight.lock().take();
    }
}

/// Closes the throwaway channel however the probe ends, including when the
/// probe future is dropped mid-wait.
struct ProbeChannel(Box<dyn PushChannel>);

impl Drop for ProbeChannel {
    fn drop(&mut self) {
        self.0.close();
    }
}

async fn run_probe(provider: Arc<dyn ChannelProvider>, spec: ChannelSpec, window: Duration) -> bool {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = ChannelSink::new(move |signal| {
        let _ = tx.send(signal);
    });

    let channel = match provider.open_channel(&spec, sink) {
        Ok(channel) => ProbeChannel(channel),
        Err(e) => {
            tracing::debug!(topic = %spec.topic, error = %e, "probe could not open channel");
            return false;
        }
    };

    let wait = async {
        let mut heartbeat_sent = false;
        while let Some(signal) = rx.recv().await {
            match signal {
                ChannelSignal::Change(_) | ChannelSignal::Heartbeat => return true,
                ChannelSignal::Status(ChannelStatus::Subscribed) => {
                    if !heartbeat_sent {
                        heartbeat_sent = true;
                        if let Err(e) = channel.0.send_heartbeat() {
                            tracing::debug!(topic = %spec.topic, error = %e, "probe heartbeat failed");
                            return false;
                        }
                    }
                }
                ChannelSignal::Status(status) => {
                    tracing::debug!(topic = %spec.topic, status = ?status, "probe channel failed");
                    return false;
                }
            }
        }
        false
    };

    let live = tokio::time::timeout(window, wait).await.unwrap_or(false);
    drop(channel);
    tracing::debug!(topic = %spec.topic, live, "probe finished");
    live
}
