use std::{collections::HashSet, time::Duration};

use super::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use shared::{
    domain::{Eta, TorrentStatus},
    protocol::{GlobalStats, SnapshotRecord},
};
use tokio::{sync::broadcast::Receiver, time::Instant};

use crate::{
    error::{IntentError, TransportError},
    store::ReconcilePolicy,
};

#[derive(Default)]
struct FakeApi {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    /// How long a pause request takes to come back.
    pause_latency: Duration,
}

impl FakeApi {
    fn fail(&self, operation: &'static str) {
        self.failing.lock().insert(operation);
    }

    fn recover(&self, operation: &'static str) {
        self.failing.lock().remove(operation);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, operation: &'static str, detail: String) -> Result<(), ApiError> {
        self.calls.lock().push(format!("{operation} {detail}"));
        if self.failing.lock().contains(operation) {
            return Err(ApiError::Transport(TransportError::Status {
                method: "POST",
                endpoint: format!("/{operation}"),
                status: StatusCode::INTERNAL_SERVER_ERROR,
                detail: "backend exploded".into(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl TorrentApi for FakeApi {
    async fn fetch_torrents(&self) -> Result<Vec<SnapshotRecord>, ApiError> {
        Ok(Vec::new())
    }

    async fn fetch_stats(&self) -> Result<GlobalStats, ApiError> {
        Ok(GlobalStats::default())
    }

    async fn pause(&self, id: &TorrentId) -> Result<(), ApiError> {
        if !self.pause_latency.is_zero() {
            tokio::time::sleep(self.pause_latency).await;
        }
        self.record("pause", id.to_string())
    }

    async fn resume(&self, id: &TorrentId) -> Result<(), ApiError> {
        self.record("resume", id.to_string())
    }

    async fn delete(&self, id: &TorrentId) -> Result<(), ApiError> {
        self.record("delete", id.to_string())
    }

    async fn update_limits(&self, id: &TorrentId, limits: SpeedLimits) -> Result<(), ApiError> {
        self.record("limits", format!("{id} {limits:?}"))
    }

    async fn set_global_limits(&self, limits: SpeedLimits) -> Result<(), ApiError> {
        self.record("global", format!("{limits:?}"))
    }

    async fn upload(&self, upload: TorrentUpload) -> Result<TorrentId, ApiError> {
        upload.validate()?;
        self.record("upload", upload.filename)?;
        Ok(TorrentId::from("new-1"))
    }
}

fn record(id: &str, status: TorrentStatus) -> SnapshotRecord {
    SnapshotRecord {
        id: TorrentId::from(id),
        name: format!("{id}.iso"),
        size_bytes: 4096,
        progress_percent: 25.0,
        download_rate_bps: 0,
        upload_rate_bps: 0,
        eta: Eta::Unknown,
        status,
        created_at: None,
        completed_at: None,
        download_limit_bps: None,
        upload_limit_bps: None,
    }
}

struct Harness {
    api: Arc<FakeApi>,
    store: Arc<StateStore>,
    dispatcher: CommandDispatcher,
    events: Receiver<MonitorEvent>,
}

fn harness() -> Harness {
    let api = Arc::new(FakeApi::default());
    let store = Arc::new(StateStore::default());
    store.apply_snapshot(vec![record("a", TorrentStatus::Downloading)]);
    let (events_tx, events) = broadcast::channel(64);
    let dispatcher = CommandDispatcher::new(api.clone(), store.clone(), events_tx);
    Harness {
        api,
        store,
        dispatcher,
        events,
    }
}

fn drain(events: &mut Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn status_of(store: &StateStore, id: &str) -> Option<TorrentStatus> {
    store.get(&TorrentId::from(id)).map(|t| t.status)
}

#[tokio::test]
async fn pause_projects_immediately_and_reports_acceptance() {
    let mut h = harness();
    h.dispatcher
        .pause(&TorrentId::from("a"))
        .await
        .expect("pause accepted");

    assert_eq!(status_of(&h.store, "a"), Some(TorrentStatus::Paused));
    assert_eq!(h.api.calls(), vec!["pause a"]);
    let events = drain(&mut h.events);
    assert!(matches!(
        events.as_slice(),
        [MonitorEvent::CommandAccepted { intent }] if intent.kind == IntentKind::Pause
    ));
}

#[tokio::test]
async fn failed_request_rolls_back_and_emits_command_failed() {
    let mut h = harness();
    h.api.fail("pause");

    let err = h
        .dispatcher
        .pause(&TorrentId::from("a"))
        .await
        .expect_err("pause fails");
    assert!(matches!(err, CommandError::Api(ApiError::Transport(_))));
    assert_eq!(status_of(&h.store, "a"), Some(TorrentStatus::Downloading));
    assert!(h.store.pending_intents().is_empty());

    let events = drain(&mut h.events);
    match events.as_slice() {
        [MonitorEvent::CommandFailed { intent, message }] => {
            assert_eq!(intent.target, TorrentId::from("a"));
            assert!(message.contains("backend exploded"));
        }
        other => panic!("unexpected events: {other:?}"),
    }
}

#[tokio::test]
async fn unknown_target_is_rejected_before_any_request() {
    let mut h = harness();
    let err = h
        .dispatcher
        .delete(&TorrentId::from("ghost"))
        .await
        .expect_err("rejected");
    assert!(matches!(
        err,
        CommandError::Rejected(IntentError::UnknownTarget(_))
    ));
    assert!(h.api.calls().is_empty());
    assert!(drain(&mut h.events).is_empty());
}

#[tokio::test]
async fn contradicted_intent_is_resent_once_then_reported_stale() {
    let mut h = harness();
    let id = TorrentId::from("a");
    h.dispatcher.pause(&id).await.expect("pause accepted");

    let outcome = h.store.apply_snapshot_and_reconcile(
        vec![record("a", TorrentStatus::Downloading)],
        Instant::now(),
    );
    h.dispatcher.settle(outcome).await;
    assert_eq!(h.api.calls(), vec!["pause a", "pause a"]);

    let outcome = h.store.apply_snapshot_and_reconcile(
        vec![record("a", TorrentStatus::Downloading)],
        Instant::now(),
    );
    h.dispatcher.settle(outcome).await;
    assert_eq!(h.api.calls().len(), 2);
    assert_eq!(status_of(&h.store, "a"), Some(TorrentStatus::Downloading));

    let stale: Vec<_> = drain(&mut h.events)
        .into_iter()
        .filter_map(|event| match event {
            MonitorEvent::CommandStale(err) => Some(err),
            _ => None,
        })
        .collect();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].intent.target, id);
}

#[tokio::test]
async fn successful_resend_is_reported_as_accepted() {
    let mut h = harness();
    h.dispatcher
        .pause(&TorrentId::from("a"))
        .await
        .expect("pause accepted");
    drain(&mut h.events);

    let outcome = h.store.apply_snapshot_and_reconcile(
        vec![record("a", TorrentStatus::Downloading)],
        Instant::now(),
    );
    h.dispatcher.settle(outcome).await;

    match drain(&mut h.events).as_slice() {
        [MonitorEvent::CommandAccepted { intent }] => {
            assert_eq!(intent.kind, IntentKind::Pause);
            assert_eq!(intent.attempts, 1);
            assert!(!intent.is_awaiting_ack());
        }
        other => panic!("unexpected events: {other:?}"),
    }
    assert!(!h.store.pending_intents()[0].is_awaiting_ack());
}

#[tokio::test(start_paused = true)]
async fn snapshot_taken_while_a_command_is_in_flight_does_not_judge_it() {
    let api = Arc::new(FakeApi {
        pause_latency: Duration::from_secs(1),
        ..FakeApi::default()
    });
    let store = Arc::new(StateStore::new(ReconcilePolicy {
        max_retries: 0,
        ..ReconcilePolicy::default()
    }));
    store.apply_snapshot(vec![record("a", TorrentStatus::Downloading)]);
    let (events_tx, mut events) = broadcast::channel(64);
    let dispatcher = Arc::new(CommandDispatcher::new(
        api.clone(),
        store.clone(),
        events_tx,
    ));

    let pausing = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.pause(&TorrentId::from("a")).await }
    });

    // the backend has not applied the pause yet
    tokio::time::sleep(Duration::from_millis(500)).await;
    let outcome = store.apply_snapshot_and_reconcile(
        vec![record("a", TorrentStatus::Downloading)],
        Instant::now(),
    );
    assert!(outcome.is_empty());
    dispatcher.settle(outcome).await;
    assert_eq!(status_of(&store, "a"), Some(TorrentStatus::Paused));

    pausing
        .await
        .expect("pause task")
        .expect("pause accepted");
    let outcome = store.apply_snapshot_and_reconcile(
        vec![record("a", TorrentStatus::Paused)],
        Instant::now(),
    );
    assert_eq!(outcome.confirmed.len(), 1);
    dispatcher.settle(outcome).await;

    assert_eq!(api.calls(), vec!["pause a"]);
    assert!(store.pending_intents().is_empty());
    let events = drain(&mut events);
    assert!(!events
        .iter()
        .any(|event| matches!(event, MonitorEvent::CommandStale(_))));
    assert!(matches!(events.last(), Some(MonitorEvent::CommandConfirmed { .. })));
}

#[tokio::test]
async fn matching_snapshot_confirms_the_intent() {
    let mut h = harness();
    h.dispatcher
        .set_limits(&TorrentId::from("a"), SpeedLimits::new(Some(1024), None))
        .await
        .expect("limits accepted");

    let mut limited = record("a", TorrentStatus::Downloading);
    limited.download_limit_bps = Some(1024);
    let outcome = h.store.apply_snapshot_and_reconcile(
        vec![limited],
        Instant::now(),
    );
    h.dispatcher.settle(outcome).await;

    assert!(h.store.pending_intents().is_empty());
    let events = drain(&mut h.events);
    assert!(matches!(events.last(), Some(MonitorEvent::CommandConfirmed { .. })));
}

#[tokio::test]
async fn failed_resend_rolls_back() {
    let mut h = harness();
    h.dispatcher
        .pause(&TorrentId::from("a"))
        .await
        .expect("pause accepted");
    h.api.fail("pause");

    let outcome = h.store.apply_snapshot_and_reconcile(
        vec![record("a", TorrentStatus::Downloading)],
        Instant::now(),
    );
    h.dispatcher.settle(outcome).await;

    assert!(h.store.pending_intents().is_empty());
    assert!(drain(&mut h.events)
        .iter()
        .any(|event| matches!(event, MonitorEvent::CommandFailed { .. })));

    h.api.recover("pause");
    h.dispatcher
        .pause(&TorrentId::from("a"))
        .await
        .expect("pause accepted again");
}

#[tokio::test]
async fn upload_records_an_intent_for_the_created_id() {
    let mut h = harness();
    let created = h
        .dispatcher
        .upload(TorrentUpload::new("fedora.torrent", b"d4:infoe".to_vec()))
        .await
        .expect("upload accepted");
    assert_eq!(created, TorrentId::from("new-1"));

    let pending = h.store.pending_intents();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].target, created);

    let outcome = h.store.apply_snapshot_and_reconcile(
        vec![
            record("a", TorrentStatus::Downloading),
            record("new-1", TorrentStatus::Queued),
        ],
        Instant::now(),
    );
    h.dispatcher.settle(outcome).await;
    assert!(h.store.pending_intents().is_empty());
    assert!(drain(&mut h.events)
        .iter()
        .any(|event| matches!(
            event,
            MonitorEvent::CommandConfirmed { intent } if intent.target == created
        )));
}

#[tokio::test]
async fn invalid_upload_never_reaches_the_backend() {
    let mut h = harness();
    let err = h
        .dispatcher
        .upload(TorrentUpload::new("notes.txt", b"hello".to_vec()))
        .await
        .expect_err("rejected");
    assert!(matches!(err, CommandError::Api(ApiError::InvalidUpload(_))));
    assert!(h.api.calls().is_empty());
    assert!(matches!(
        drain(&mut h.events).as_slice(),
        [MonitorEvent::UploadFailed { filename, .. }] if filename == "notes.txt"
    ));
}

#[tokio::test]
async fn global_limits_leave_the_store_alone() {
    let mut h = harness();
    let before = h.store.read();
    h.dispatcher
        .set_global_limits(SpeedLimits::new(Some(10_000), Some(5_000)))
        .await
        .expect("global limits accepted");

    assert_eq!(h.store.read(), before);
    assert!(h.store.pending_intents().is_empty());
    assert_eq!(h.api.calls().len(), 1);
    assert!(matches!(
        drain(&mut h.events).as_slice(),
        [MonitorEvent::GlobalLimitsUpdated { .. }]
    ));
}
