//! Client-side state reconciliation for a torrent dashboard.
//!
//! A [`store::StateStore`] is fed by periodic snapshots ([`poller`]) and
//! websocket deltas ([`push_channel`]); user commands go through
//! [`dispatcher::CommandDispatcher`] as optimistic intents that later
//! snapshots confirm or contradict. [`monitor::TorrentMonitor`] wires the
//! pieces together.

use shared::domain::SpeedLimits;

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod monitor;
pub mod poller;
pub mod push_channel;
pub mod store;
pub mod transport;
pub mod view;

pub use config::{load_settings, MonitorSettings};
pub use monitor::TorrentMonitor;
pub use push_channel::ChannelState;
pub use store::{CommandIntent, IntentKind, StateStore, Torrent};

use crate::error::StaleCommandError;

/// Notifications for the presentation layer.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    SnapshotApplied {
        torrents: usize,
    },
    PollFailed {
        message: String,
    },
    DeltasApplied {
        applied: usize,
        discarded: usize,
    },
    ChannelStateChanged(ChannelState),
    /// The backend accepted the request; the intent waits for a snapshot.
    CommandAccepted {
        intent: CommandIntent,
    },
    CommandConfirmed {
        intent: CommandIntent,
    },
    /// The request failed and the optimistic projection was rolled back.
    CommandFailed {
        intent: CommandIntent,
        message: String,
    },
    CommandStale(StaleCommandError),
    UploadFailed {
        filename: String,
        message: String,
    },
    GlobalLimitsUpdated {
        limits: SpeedLimits,
    },
    GlobalLimitsFailed {
        limits: SpeedLimits,
        message: String,
    },
}
