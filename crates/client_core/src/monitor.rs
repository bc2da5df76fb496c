use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    config::MonitorSettings,
    dispatcher::CommandDispatcher,
    error::{ApiError, ChannelError},
    poller::{self, PollGate, SnapshotPoller},
    push_channel::{ChannelState, PushChannel},
    store::StateStore,
    transport::{push_channel_url, HttpTorrentApi, TorrentApi},
    view::DashboardView,
    MonitorEvent,
};

const EVENT_CAPACITY: usize = 256;

struct Running {
    poller: SnapshotPoller,
    channel: PushChannel,
}

/// Owns the store plus the poll timer and push socket feeding it. Nothing
/// runs until [`TorrentMonitor::start`]; dropping the monitor stops both.
pub struct TorrentMonitor {
    settings: MonitorSettings,
    api: Arc<dyn TorrentApi>,
    store: Arc<StateStore>,
    dispatcher: Arc<CommandDispatcher>,
    events: broadcast::Sender<MonitorEvent>,
    poll_gate: PollGate,
    running: Mutex<Option<Running>>,
}

impl TorrentMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        let api = Arc::new(HttpTorrentApi::new(settings.api_base_url.clone()));
        Self::with_api(settings, api)
    }

    pub fn with_api(settings: MonitorSettings, api: Arc<dyn TorrentApi>) -> Self {
        let store = Arc::new(StateStore::new(settings.reconcile));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let dispatcher = Arc::new(CommandDispatcher::new(
            api.clone(),
            store.clone(),
            events.clone(),
        ));
        Self {
            settings,
            api,
            store,
            dispatcher,
            events,
            poll_gate: PollGate::default(),
            running: Mutex::new(None),
        }
    }

    /// Start polling and open the push channel. Calling it while already
    /// running does nothing.
    pub fn start(&self) -> Result<(), ChannelError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let ws_url = push_channel_url(&self.settings.api_base_url)?;
        info!(api = %self.settings.api_base_url, push = %ws_url, "starting torrent monitor");
        let channel = PushChannel::open(
            ws_url,
            self.store.clone(),
            self.settings.reconnect,
            self.events.clone(),
        );
        let poller = SnapshotPoller::start(
            self.api.clone(),
            self.dispatcher.clone(),
            self.events.clone(),
            self.settings.poll,
            self.poll_gate.clone(),
        );
        *running = Some(Running { poller, channel });
        Ok(())
    }

    /// Stop the poll timer and close the push channel. Idempotent.
    pub fn stop(&self) {
        if let Some(Running { poller, channel }) = self.running.lock().take() {
            poller.stop();
            channel.close();
            info!("torrent monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.channel.state())
            .unwrap_or(ChannelState::Disconnected)
    }

    /// One poll cycle outside the timer, with the snapshot error surfaced.
    /// A timed poll already in flight is waited for first, and timer ticks
    /// landing on this one are dropped.
    pub async fn refresh(&self) -> Result<usize, ApiError> {
        let _held = match self.poll_gate.try_lock() {
            Ok(held) => held,
            Err(_) => {
                debug!("waiting for the in-flight snapshot poll");
                self.poll_gate.lock().await
            }
        };
        poller::poll_cycle(
            self.api.as_ref(),
            &self.dispatcher,
            &self.events,
            self.settings.poll.fetch_stats,
        )
        .await
    }

    pub fn view(&self) -> DashboardView {
        DashboardView::project(&self.store.read(), self.store.server_stats())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }
}

impl Drop for TorrentMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "tests/monitor_tests.rs"]
mod tests;
