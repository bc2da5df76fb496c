use std::sync::Arc;

use shared::domain::{SpeedLimits, TorrentId};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    error::{ApiError, CommandError},
    store::{CommandIntent, IntentId, IntentKind, ReconcileOutcome, StateStore},
    transport::{TorrentApi, TorrentUpload},
    MonitorEvent,
};

/// Turns user actions into pending intents plus backend requests, and
/// reports how each one ends.
pub struct CommandDispatcher {
    api: Arc<dyn TorrentApi>,
    store: Arc<StateStore>,
    events: broadcast::Sender<MonitorEvent>,
}

impl CommandDispatcher {
    pub fn new(
        api: Arc<dyn TorrentApi>,
        store: Arc<StateStore>,
        events: broadcast::Sender<MonitorEvent>,
    ) -> Self {
        Self { api, store, events }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub async fn pause(&self, id: &TorrentId) -> Result<IntentId, CommandError> {
        self.submit(id, IntentKind::Pause).await
    }

    pub async fn resume(&self, id: &TorrentId) -> Result<IntentId, CommandError> {
        self.submit(id, IntentKind::Resume).await
    }

    pub async fn delete(&self, id: &TorrentId) -> Result<IntentId, CommandError> {
        self.submit(id, IntentKind::Delete).await
    }

    pub async fn set_limits(
        &self,
        id: &TorrentId,
        limits: SpeedLimits,
    ) -> Result<IntentId, CommandError> {
        self.submit(id, IntentKind::SetLimits(limits)).await
    }

    /// Upload a `.torrent` file. The backend-assigned id becomes the target
    /// of an upload intent that the next snapshot listing it confirms.
    pub async fn upload(&self, upload: TorrentUpload) -> Result<TorrentId, CommandError> {
        let filename = upload.filename.clone();
        let result = match upload.validate() {
            Ok(()) => self.api.upload(upload).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(id) => {
                let intent = CommandIntent::new(
                    id.clone(),
                    IntentKind::Upload {
                        filename: filename.clone(),
                    },
                );
                self.store.apply_intent(intent.clone())?;
                info!(torrent_id = %id, %filename, "upload accepted");
                let _ = self.events.send(MonitorEvent::CommandAccepted { intent });
                Ok(id)
            }
            Err(err) => {
                warn!(%filename, error = %err, "upload failed");
                let _ = self.events.send(MonitorEvent::UploadFailed {
                    filename,
                    message: err.to_string(),
                });
                Err(err.into())
            }
        }
    }

    /// Global limits have no entity to project onto; the result is reported
    /// and nothing in the store changes.
    pub async fn set_global_limits(&self, limits: SpeedLimits) -> Result<(), CommandError> {
        match self.api.set_global_limits(limits).await {
            Ok(()) => {
                info!(?limits, "global limits updated");
                let _ = self
                    .events
                    .send(MonitorEvent::GlobalLimitsUpdated { limits });
                Ok(())
            }
            Err(err) => {
                warn!(?limits, error = %err, "global limits update failed");
                let _ = self.events.send(MonitorEvent::GlobalLimitsFailed {
                    limits,
                    message: err.to_string(),
                });
                Err(err.into())
            }
        }
    }

    /// Report a reconcile outcome and re-send every retried intent.
    pub async fn settle(&self, outcome: ReconcileOutcome) {
        for intent in outcome.confirmed {
            debug!(
                intent_id = intent.id.0,
                torrent_id = %intent.target,
                kind = intent.kind.name(),
                "command confirmed"
            );
            let _ = self.events.send(MonitorEvent::CommandConfirmed { intent });
        }

        for stale in outcome.failed {
            warn!(error = %stale, "command went stale");
            let _ = self.events.send(MonitorEvent::CommandStale(stale));
        }

        for intent in outcome.retries {
            info!(
                intent_id = intent.id.0,
                torrent_id = %intent.target,
                kind = intent.kind.name(),
                attempt = intent.attempts,
                "re-sending unconfirmed command"
            );
            match self.send(&intent).await {
                Ok(()) => {
                    let intent = self.store.acknowledge(intent.id).unwrap_or(intent);
                    let _ = self.events.send(MonitorEvent::CommandAccepted { intent });
                }
                Err(err) => self.fail(intent, &err),
            }
        }
    }

    async fn submit(&self, target: &TorrentId, kind: IntentKind) -> Result<IntentId, CommandError> {
        let intent = CommandIntent::new(target.clone(), kind).unacknowledged();
        let intent_id = match self.store.apply_intent(intent.clone()) {
            Ok(intent_id) => intent_id,
            Err(err) => {
                warn!(
                    torrent_id = %target,
                    kind = intent.kind.name(),
                    error = %err,
                    "command rejected"
                );
                return Err(err.into());
            }
        };

        match self.send(&intent).await {
            Ok(()) => {
                info!(
                    intent_id = intent_id.0,
                    torrent_id = %target,
                    kind = intent.kind.name(),
                    "command accepted"
                );
                // a snapshot may have pruned the target while the request ran
                let intent = self.store.acknowledge(intent_id).unwrap_or(intent);
                let _ = self.events.send(MonitorEvent::CommandAccepted { intent });
                Ok(intent_id)
            }
            Err(err) => {
                self.fail(intent, &err);
                Err(err.into())
            }
        }
    }

    fn fail(&self, intent: CommandIntent, err: &ApiError) {
        self.store.rollback(intent.id);
        warn!(
            intent_id = intent.id.0,
            torrent_id = %intent.target,
            kind = intent.kind.name(),
            error = %err,
            "command failed; projection rolled back"
        );
        let _ = self.events.send(MonitorEvent::CommandFailed {
            intent,
            message: err.to_string(),
        });
    }

    async fn send(&self, intent: &CommandIntent) -> Result<(), ApiError> {
        let target = &intent.target;
        match &intent.kind {
            IntentKind::Pause => self.api.pause(target).await,
            IntentKind::Resume => self.api.resume(target).await,
            IntentKind::Delete => self.api.delete(target).await,
            IntentKind::SetLimits(limits) => self.api.update_limits(target, *limits).await,
            IntentKind::Upload { filename } => {
                // the file bytes are gone by now; wait for a later snapshot
                debug!(torrent_id = %target, %filename, "upload is not re-sent");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
