//! Canonical in-memory view of every torrent.
//!
//! Two sources feed the store: full snapshots from the poller and partial
//! deltas from the push channel. Snapshots own existence, identity and status
//! and always overwrite every field; deltas only touch the four numeric fields
//! and only between snapshots. Pending command intents are kept beside the
//! confirmed state and layered on top of it when the store is read, so
//! rolling an intent back never needs to undo a write.
//!
//! Every mutation is a synchronous method running under one store-wide lock
//! and never awaits, so an aborted task can't leave a half-applied write.

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use shared::{
    domain::{Eta, SpeedLimits, TorrentId, TorrentStatus},
    protocol::{DeltaRecord, GlobalStats, SnapshotRecord},
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{IntentError, StaleCommandError};

static NEXT_INTENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq)]
pub struct Torrent {
    pub id: TorrentId,
    pub name: String,
    pub size_bytes: u64,
    pub status: TorrentStatus,
    pub progress_percent: f64,
    pub download_rate_bps: u64,
    pub upload_rate_bps: u64,
    pub eta: Eta,
    pub download_limit_bps: Option<u64>,
    pub upload_limit_bps: Option<u64>,
    pub created_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
}

impl Torrent {
    pub fn from_record(record: SnapshotRecord) -> Self {
        let mut torrent = Self {
            id: record.id,
            name: record.name,
            size_bytes: record.size_bytes,
            status: record.status,
            progress_percent: record.progress_percent,
            download_rate_bps: record.download_rate_bps,
            upload_rate_bps: record.upload_rate_bps,
            eta: record.eta,
            download_limit_bps: record.download_limit_bps,
            upload_limit_bps: record.upload_limit_bps,
            created_at: record.created_at,
            completed_at: record.completed_at,
        };
        torrent.progress_percent = torrent.normalized_progress(torrent.progress_percent);
        torrent
    }

    pub fn limits(&self) -> SpeedLimits {
        SpeedLimits::new(self.download_limit_bps, self.upload_limit_bps)
    }

    /// Bytes already on disk, derived from size and progress.
    pub fn downloaded_bytes(&self) -> u64 {
        ((self.size_bytes as f64) * self.progress_percent / 100.0).round() as u64
    }

    fn normalized_progress(&self, progress: f64) -> f64 {
        if self.status == TorrentStatus::Completed {
            return 100.0;
        }
        if progress.is_nan() {
            return 0.0;
        }
        progress.clamp(0.0, 100.0)
    }

    fn apply_delta(&mut self, delta: &DeltaRecord) {
        if let Some(progress) = delta.progress_percent {
            let progress = self.normalized_progress(progress);
            // progress never moves backwards while downloading
            self.progress_percent = if self.status == TorrentStatus::Downloading {
                progress.max(self.progress_percent)
            } else {
                progress
            };
        }
        if let Some(rate) = delta.download_rate_bps {
            self.download_rate_bps = rate;
        }
        if let Some(rate) = delta.upload_rate_bps {
            self.upload_rate_bps = rate;
        }
        if let Some(eta) = delta.eta {
            self.eta = eta;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntentId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentKind {
    Pause,
    Resume,
    Delete,
    SetLimits(SpeedLimits),
    /// The target is the id the backend assigned to the uploaded file.
    Upload {
        filename: String,
    },
}

impl IntentKind {
    pub fn name(&self) -> &'static str {
        match self {
            IntentKind::Pause => "pause",
            IntentKind::Resume => "resume",
            IntentKind::Delete => "delete",
            IntentKind::SetLimits(_) => "set_limits",
            IntentKind::Upload { .. } => "upload",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandIntent {
    pub id: IntentId,
    pub target: TorrentId,
    pub kind: IntentKind,
    pub issued_at: Instant,
    /// Number of times the request has been re-sent after a snapshot did not
    /// show its effect.
    pub attempts: u32,
    /// Set once a snapshot showed the expected effect.
    pub confirmed: bool,
    /// The request is on the wire; no snapshot can judge it yet.
    awaiting_ack: bool,
    checked_generation: u64,
}

impl CommandIntent {
    pub fn new(target: TorrentId, kind: IntentKind) -> Self {
        Self {
            id: IntentId(NEXT_INTENT_ID.fetch_add(1, Ordering::Relaxed)),
            target,
            kind,
            issued_at: Instant::now(),
            attempts: 0,
            confirmed: false,
            awaiting_ack: false,
            checked_generation: 0,
        }
    }

    /// Mark the intent as sent but not yet answered. Reconcile leaves it
    /// alone until [`StateStore::acknowledge`] is called for it.
    pub fn unacknowledged(mut self) -> Self {
        self.awaiting_ack = true;
        self
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }

    fn is_projected(&self, now: Instant, delete_timeout: Duration) -> bool {
        if self.attempts > 0 {
            return false;
        }
        match self.kind {
            IntentKind::Delete => now.saturating_duration_since(self.issued_at) < delete_timeout,
            _ => true,
        }
    }

    fn project(&self, entities: &mut HashMap<TorrentId, Torrent>) {
        match &self.kind {
            IntentKind::Delete => {
                entities.remove(&self.target);
            }
            IntentKind::Upload { .. } => {}
            kind => {
                let Some(torrent) = entities.get_mut(&self.target) else {
                    return;
                };
                match kind {
                    // a seeding torrent keeps reporting completed
                    IntentKind::Pause if torrent.status != TorrentStatus::Completed => {
                        torrent.status = TorrentStatus::Paused;
                    }
                    IntentKind::Resume if torrent.status != TorrentStatus::Completed => {
                        torrent.status = TorrentStatus::Downloading;
                    }
                    IntentKind::SetLimits(limits) => {
                        torrent.download_limit_bps = limits.download_bps;
                        torrent.upload_limit_bps = limits.upload_bps;
                    }
                    _ => {}
                }
            }
        }
    }

    fn is_reflected_in(&self, entities: &HashMap<TorrentId, Torrent>) -> bool {
        let current = entities.get(&self.target);
        match &self.kind {
            IntentKind::Delete => current.is_none(),
            IntentKind::Upload { .. } => current.is_some(),
            IntentKind::Pause => current.is_some_and(|t| {
                matches!(t.status, TorrentStatus::Paused | TorrentStatus::Completed)
            }),
            IntentKind::Resume => current.is_some_and(|t| {
                !matches!(t.status, TorrentStatus::Paused | TorrentStatus::Error)
            }),
            IntentKind::SetLimits(limits) => current.is_some_and(|t| t.limits() == *limits),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// How many times an unconfirmed intent is re-sent before it is reported
    /// stale.
    pub max_retries: u32,
    /// How long a pending delete hides its torrent and drops its deltas.
    pub delete_timeout: Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            delete_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub confirmed: Vec<CommandIntent>,
    /// Intents whose request must be sent again.
    pub retries: Vec<CommandIntent>,
    pub failed: Vec<StaleCommandError>,
}

impl ReconcileOutcome {
    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.retries.is_empty() && self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied,
    UnknownTarget,
    /// A pending delete is hiding the torrent.
    Suppressed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaBatchSummary {
    pub applied: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, Copy)]
struct SnapshotMark {
    requested_at: Instant,
    generation: u64,
}

#[derive(Default)]
struct StoreInner {
    confirmed: HashMap<TorrentId, Torrent>,
    pending: Vec<CommandIntent>,
    /// Delete intents settled by a snapshot prune, reported by the next
    /// reconcile.
    settled: Vec<CommandIntent>,
    last_snapshot: Option<SnapshotMark>,
    generation: u64,
    server_stats: Option<GlobalStats>,
}

impl StoreInner {
    fn suppresses(&self, id: &TorrentId, now: Instant, policy: &ReconcilePolicy) -> bool {
        self.pending.iter().any(|intent| {
            intent.kind == IntentKind::Delete
                && intent.target == *id
                && intent.is_projected(now, policy.delete_timeout)
        })
    }

    /// Returns false when a newer snapshot has already been applied.
    fn apply_snapshot(&mut self, records: Vec<SnapshotRecord>, requested_at: Instant) -> bool {
        if let Some(last) = self.last_snapshot {
            if requested_at < last.requested_at {
                debug!(
                    behind = ?last.requested_at.saturating_duration_since(requested_at),
                    "ignoring snapshot requested before the current one"
                );
                return false;
            }
        }

        let mut next = HashMap::with_capacity(records.len());
        for record in records {
            let torrent = Torrent::from_record(record);
            if let Some(previous) = next.insert(torrent.id.clone(), torrent) {
                warn!(
                    torrent_id = %previous.id,
                    "snapshot listed torrent twice; keeping last entry"
                );
            }
        }

        let removed: HashSet<TorrentId> = self
            .confirmed
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();

        if !removed.is_empty() {
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
                .into_iter()
                .partition(|intent| removed.contains(&intent.target));
            self.pending = kept;
            for mut intent in gone {
                if intent.kind == IntentKind::Delete {
                    intent.confirmed = true;
                    self.settled.push(intent);
                } else {
                    debug!(
                        intent_id = intent.id.0,
                        torrent_id = %intent.target,
                        kind = intent.kind.name(),
                        "dropping intent for torrent removed by snapshot"
                    );
                }
            }
        }

        self.confirmed = next;
        self.generation += 1;
        self.last_snapshot = Some(SnapshotMark {
            requested_at,
            generation: self.generation,
        });
        true
    }

    fn reconcile(&mut self, policy: &ReconcilePolicy) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome {
            confirmed: std::mem::take(&mut self.settled),
            ..ReconcileOutcome::default()
        };
        let Some(mark) = self.last_snapshot else {
            return outcome;
        };

        let now = Instant::now();
        let mut still_pending = Vec::with_capacity(self.pending.len());
        for mut intent in std::mem::take(&mut self.pending) {
            // the request is still in flight, the snapshot was requested
            // before the backend accepted it, or this intent was already
            // judged against it
            if intent.awaiting_ack
                || intent.issued_at > mark.requested_at
                || intent.checked_generation >= mark.generation
            {
                still_pending.push(intent);
                continue;
            }
            intent.checked_generation = mark.generation;

            if intent.is_reflected_in(&self.confirmed) {
                intent.confirmed = true;
                outcome.confirmed.push(intent);
            } else if intent.attempts < policy.max_retries {
                intent.attempts += 1;
                intent.issued_at = now;
                intent.awaiting_ack = true;
                outcome.retries.push(intent.clone());
                still_pending.push(intent);
            } else {
                outcome.failed.push(StaleCommandError { intent });
            }
        }
        self.pending = still_pending;
        outcome
    }

    fn visible(&self, now: Instant, policy: &ReconcilePolicy) -> HashMap<TorrentId, Torrent> {
        let mut view = self.confirmed.clone();
        for intent in &self.pending {
            if intent.is_projected(now, policy.delete_timeout) {
                intent.project(&mut view);
            }
        }
        view
    }
}

pub struct StateStore {
    inner: Mutex<StoreInner>,
    policy: ReconcilePolicy,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(ReconcilePolicy::default())
    }
}

impl StateStore {
    pub fn new(policy: ReconcilePolicy) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            policy,
        }
    }

    /// Replace the whole mapping with `records`, as of now.
    pub fn apply_snapshot(&self, records: Vec<SnapshotRecord>) -> bool {
        self.apply_snapshot_at(records, Instant::now())
    }

    /// Replace the whole mapping with `records`. `requested_at` is when the
    /// poll request left, which is what decides which intents the snapshot
    /// can confirm. A snapshot requested before the last applied one is
    /// dropped and `false` is returned.
    pub fn apply_snapshot_at(&self, records: Vec<SnapshotRecord>, requested_at: Instant) -> bool {
        self.inner.lock().apply_snapshot(records, requested_at)
    }

    /// Apply a snapshot and reconcile pending intents against it without
    /// letting any other mutation in between.
    pub fn apply_snapshot_and_reconcile(
        &self,
        records: Vec<SnapshotRecord>,
        requested_at: Instant,
    ) -> ReconcileOutcome {
        let mut inner = self.inner.lock();
        if !inner.apply_snapshot(records, requested_at) {
            return ReconcileOutcome::default();
        }
        inner.reconcile(&self.policy)
    }

    pub fn apply_delta(&self, id: &TorrentId, delta: &DeltaRecord) -> DeltaOutcome {
        let mut inner = self.inner.lock();
        apply_delta_locked(&mut inner, id, delta, &self.policy)
    }

    /// Apply one push batch under a single lock acquisition.
    pub fn apply_deltas<'a, I>(&self, batch: I) -> DeltaBatchSummary
    where
        I: IntoIterator<Item = (&'a TorrentId, &'a DeltaRecord)>,
    {
        let mut inner = self.inner.lock();
        let mut summary = DeltaBatchSummary::default();
        for (id, delta) in batch {
            match apply_delta_locked(&mut inner, id, delta, &self.policy) {
                DeltaOutcome::Applied => summary.applied += 1,
                DeltaOutcome::UnknownTarget | DeltaOutcome::Suppressed => summary.discarded += 1,
            }
        }
        summary
    }

    /// Record `intent` as pending and apply its optimistic projection.
    pub fn apply_intent(&self, intent: CommandIntent) -> Result<IntentId, IntentError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if !matches!(intent.kind, IntentKind::Upload { .. })
            && (!inner.confirmed.contains_key(&intent.target)
                || inner.suppresses(&intent.target, now, &self.policy))
        {
            return Err(IntentError::UnknownTarget(intent.target));
        }

        debug!(
            intent_id = intent.id.0,
            torrent_id = %intent.target,
            kind = intent.kind.name(),
            "recorded pending intent"
        );
        let id = intent.id;
        inner.pending.push(intent);
        Ok(id)
    }

    /// Drop a pending intent whose request failed. Reads fall back to the
    /// last confirmed state for its torrent.
    pub fn rollback(&self, intent_id: IntentId) -> Option<CommandIntent> {
        let mut inner = self.inner.lock();
        let position = inner
            .pending
            .iter()
            .position(|intent| intent.id == intent_id)?;
        Some(inner.pending.remove(position))
    }

    /// The backend accepted the request behind a pending intent. Only
    /// snapshots requested from now on can judge it. Returns `None` when the
    /// intent is no longer pending.
    pub fn acknowledge(&self, intent_id: IntentId) -> Option<CommandIntent> {
        let mut inner = self.inner.lock();
        let intent = inner
            .pending
            .iter_mut()
            .find(|intent| intent.id == intent_id)?;
        intent.awaiting_ack = false;
        intent.issued_at = Instant::now();
        Some(intent.clone())
    }

    /// Judge pending intents against the last snapshot. Retried intents come
    /// back awaiting acknowledgement of their re-sent request.
    pub fn reconcile(&self) -> ReconcileOutcome {
        self.inner.lock().reconcile(&self.policy)
    }

    pub fn apply_stats(&self, stats: GlobalStats) {
        self.inner.lock().server_stats = Some(stats);
    }

    pub fn server_stats(&self) -> Option<GlobalStats> {
        self.inner.lock().server_stats.clone()
    }

    /// Point-in-time copy of every visible torrent, pending intents applied.
    pub fn read(&self) -> HashMap<TorrentId, Torrent> {
        self.inner.lock().visible(Instant::now(), &self.policy)
    }

    pub fn get(&self, id: &TorrentId) -> Option<Torrent> {
        self.read().remove(id)
    }

    pub fn pending_intents(&self) -> Vec<CommandIntent> {
        self.inner.lock().pending.clone()
    }

    pub fn has_snapshot(&self) -> bool {
        self.inner.lock().last_snapshot.is_some()
    }
}

fn apply_delta_locked(
    inner: &mut StoreInner,
    id: &TorrentId,
    delta: &DeltaRecord,
    policy: &ReconcilePolicy,
) -> DeltaOutcome {
    if inner.suppresses(id, Instant::now(), policy) {
        return DeltaOutcome::Suppressed;
    }
    match inner.confirmed.get_mut(id) {
        Some(torrent) => {
            torrent.apply_delta(delta);
            DeltaOutcome::Applied
        }
        None => DeltaOutcome::UnknownTarget,
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
