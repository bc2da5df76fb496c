//! Periodic full refresh from `GET /torrents`.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{dispatcher::CommandDispatcher, error::ApiError, transport::TorrentApi, MonitorEvent};

const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Held for the whole of a poll cycle. The timer and manual refreshes share
/// one, so two snapshot requests are never in flight together.
pub type PollGate = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    /// Also refresh backend-reported stats through `GET /stats`.
    pub fetch_stats: bool,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            fetch_stats: true,
        }
    }
}

/// Fires a snapshot poll on a fixed cadence, whatever the push channel is
/// doing. At most one poll is in flight; ticks that land on a running poll,
/// whether timed or manual, are dropped.
pub struct SnapshotPoller {
    ticker: Mutex<Option<JoinHandle<()>>>,
    in_flight: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SnapshotPoller {
    /// Start ticking. The first poll fires immediately. Must be called from
    /// within a tokio runtime.
    pub fn start(
        api: Arc<dyn TorrentApi>,
        dispatcher: Arc<CommandDispatcher>,
        events: broadcast::Sender<MonitorEvent>,
        settings: PollSettings,
        gate: PollGate,
    ) -> Self {
        let in_flight: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
        let slot = in_flight.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = time::interval(settings.interval.max(MIN_INTERVAL));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Ok(held) = gate.clone().try_lock_owned() else {
                    debug!("snapshot poll still in flight; dropping tick");
                    continue;
                };
                let api = api.clone();
                let dispatcher = dispatcher.clone();
                let events = events.clone();
                *slot.lock() = Some(tokio::spawn(async move {
                    let _held = held;
                    poll_once(api, dispatcher, events, settings.fetch_stats).await;
                }));
            }
        });
        Self {
            ticker: Mutex::new(Some(ticker)),
            in_flight,
        }
    }

    /// Stop ticking and abandon the in-flight poll, if any. Idempotent.
    pub fn stop(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
            debug!("snapshot poller stopped");
        }
        if let Some(poll) = self.in_flight.lock().take() {
            poll.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .as_ref()
            .is_some_and(|ticker| !ticker.is_finished())
    }
}

impl Drop for SnapshotPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_once(
    api: Arc<dyn TorrentApi>,
    dispatcher: Arc<CommandDispatcher>,
    events: broadcast::Sender<MonitorEvent>,
    fetch_stats: bool,
) {
    if let Err(err) = poll_cycle(api.as_ref(), &dispatcher, &events, fetch_stats).await {
        warn!(error = %err, "snapshot poll failed; skipping cycle");
        let _ = events.send(MonitorEvent::PollFailed {
            message: err.to_string(),
        });
    }
}

/// One snapshot fetch, reconcile and settle, then the optional stats fetch.
/// Callers hold the [`PollGate`] for the duration. Returns how many torrents
/// the snapshot listed.
pub(crate) async fn poll_cycle(
    api: &dyn TorrentApi,
    dispatcher: &CommandDispatcher,
    events: &broadcast::Sender<MonitorEvent>,
    fetch_stats: bool,
) -> Result<usize, ApiError> {
    let store = dispatcher.store();
    let requested_at = Instant::now();
    let snapshot = match api.fetch_torrents().await {
        Ok(records) => {
            let torrents = records.len();
            let outcome = store.apply_snapshot_and_reconcile(records, requested_at);
            debug!(
                torrents,
                confirmed = outcome.confirmed.len(),
                retries = outcome.retries.len(),
                stale = outcome.failed.len(),
                "snapshot applied"
            );
            let _ = events.send(MonitorEvent::SnapshotApplied { torrents });
            if !outcome.is_empty() {
                dispatcher.settle(outcome).await;
            }
            Ok(torrents)
        }
        Err(err) => Err(err),
    };

    if fetch_stats {
        match api.fetch_stats().await {
            Ok(stats) => store.apply_stats(stats),
            Err(err) => warn!(error = %err, "stats poll failed"),
        }
    }
    snapshot
}

#[cfg(test)]
#[path = "tests/poller_tests.rs"]
mod tests;
