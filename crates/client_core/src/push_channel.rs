//! Websocket push channel delivering `torrent_update` deltas.
//!
//! The channel never tries to detect lost messages; the snapshot poller is
//! the backstop for anything dropped while disconnected.

use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use shared::protocol::PushMessage;
use tokio::{
    net::TcpStream,
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::ChannelError, store::StateStore, transport::decode_push_message, MonitorEvent,
};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Upper bound of the jitter window after `failures` consecutive failed
    /// attempts: `min(max_delay, base_delay * 2^failures)`.
    pub fn ceiling(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn delay<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let ceiling_ms = u64::try_from(self.ceiling(failures).as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rng.gen_range(0..=ceiling_ms))
    }
}

pub struct PushChannel {
    state: watch::Receiver<ChannelState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PushChannel {
    /// Spawn the connection task. Must be called from within a tokio runtime.
    pub fn open(
        url: Url,
        store: Arc<StateStore>,
        policy: ReconnectPolicy,
        events: broadcast::Sender<MonitorEvent>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_channel(
            url,
            store,
            policy,
            StateReporter { state_tx, events },
            shutdown_rx,
        ));
        Self {
            state: state_rx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Stop the channel. Safe to call any number of times, from any state;
    /// a pending reconnect timer is cancelled.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    /// Close and wait for the connection task to finish.
    pub async fn closed(&self) {
        self.close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.close();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

struct StateReporter {
    state_tx: watch::Sender<ChannelState>,
    events: broadcast::Sender<MonitorEvent>,
}

impl StateReporter {
    fn set(&self, next: ChannelState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(state = ?next, "push channel state changed");
            let _ = self.events.send(MonitorEvent::ChannelStateChanged(next));
        }
    }
}

async fn run_channel(
    url: Url,
    store: Arc<StateStore>,
    policy: ReconnectPolicy,
    reporter: StateReporter,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }

        reporter.set(ChannelState::Connecting);
        let connected = tokio::select! {
            _ = shutdown.changed() => break,
            result = connect_async(url.as_str()) => result,
        };

        match connected {
            Ok((stream, _)) => {
                failures = 0;
                reporter.set(ChannelState::Open);
                info!(%url, "push channel open");
                match pump(stream, &store, &reporter, &mut shutdown).await {
                    Ok(()) => break,
                    Err(err) => warn!(error = %err, "push channel dropped"),
                }
            }
            Err(source) => {
                let err = ChannelError::Connect {
                    url: url.to_string(),
                    source,
                };
                warn!(error = %err, failures, "push channel connect failed");
            }
        }

        reporter.set(ChannelState::Disconnected);
        let delay = policy.delay(failures, &mut rand::thread_rng());
        failures = failures.saturating_add(1);
        debug!(?delay, failures, "push channel reconnect scheduled");
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    reporter.set(ChannelState::Disconnected);
    debug!("push channel task finished");
}

/// Read until the server goes away (`Err`) or shutdown is requested (`Ok`).
async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    store: &StateStore,
    reporter: &StateReporter,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ChannelError> {
    let (mut writer, mut reader) = stream.split();
    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => {
                reporter.set(ChannelState::Closing);
                let _ = tokio::time::timeout(CLOSE_GRACE, writer.send(Message::Close(None))).await;
                return Ok(());
            }
            message = reader.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => apply_push_text(store, reporter, &text),
            Some(Ok(Message::Close(_))) | None => return Err(ChannelError::ClosedByServer),
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(ChannelError::Receive(err)),
        }
    }
}

fn apply_push_text(store: &StateStore, reporter: &StateReporter, text: &str) {
    match decode_push_message(text) {
        Ok(PushMessage::TorrentUpdate { stats }) => {
            let summary = store.apply_deltas(&stats);
            debug!(
                applied = summary.applied,
                discarded = summary.discarded,
                "applied push batch"
            );
            let _ = reporter.events.send(MonitorEvent::DeltasApplied {
                applied: summary.applied,
                discarded: summary.discarded,
            });
        }
        Err(err) => warn!(error = %err, "discarding push message"),
    }
}

#[cfg(test)]
#[path = "tests/push_channel_tests.rs"]
mod tests;
