//! End-to-end lifecycle tests: intake requests through the tracker, durable
//! store underneath, scripted remote authority on the far side.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use revclock_api_client::{ApiError, DeliveryAck};
use revclock_core::{EndReason, MutationKind, PageContext, SyncQueueItem, testing};
use revclock_daemon::activity::ActivityMonitor;
use revclock_daemon::dispatcher::{Authority, SyncDispatcher, TokenProvider};
use revclock_daemon::events::IntakeRequest;
use revclock_daemon::registry::SessionRegistry;
use revclock_daemon::tracker::Tracker;
use revclock_store::Store;

#[derive(Clone, Default)]
struct ScriptedAuthority {
    script: Arc<Mutex<VecDeque<Result<DeliveryAck, ApiError>>>>,
    seen: Arc<Mutex<Vec<SyncQueueItem>>>,
}

impl ScriptedAuthority {
    fn push_ok(&self, remote_id: Option<&str>) {
        self.script.lock().unwrap().push_back(Ok(DeliveryAck {
            remote_id: remote_id.map(String::from),
        }));
    }

    fn push_err(&self, err: ApiError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    fn seen(&self) -> Vec<SyncQueueItem> {
        self.seen.lock().unwrap().clone()
    }
}

impl Authority for ScriptedAuthority {
    async fn deliver(&self, item: &SyncQueueItem) -> Result<DeliveryAck, ApiError> {
        self.seen.lock().unwrap().push(item.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(DeliveryAck::default()))
    }

    fn set_token(&mut self, _token: String) {}
}

struct NoTokens;

impl TokenProvider for NoTokens {
    async fn refresh(&mut self) -> Result<String> {
        anyhow::bail!("no token source in tests")
    }
}

struct Harness {
    registry: SessionRegistry,
    authority: ScriptedAuthority,
    tracker: Tracker<ScriptedAuthority, NoTokens>,
    t0: DateTime<Utc>,
}

impl Harness {
    fn new(dir: &tempfile::TempDir) -> Self {
        let store = Store::new(dir.path().join("state.json"));
        let registry = SessionRegistry::new(store.clone());
        let authority = ScriptedAuthority::default();
        let dispatcher = SyncDispatcher::new(store, authority.clone(), NoTokens, 3);
        let tracker = Tracker::new(registry.clone(), ActivityMonitor::new(5), dispatcher, 300);
        Self {
            registry,
            authority,
            tracker,
            t0: Utc::now(),
        }
    }

    fn at(&self, secs: i64) -> DateTime<Utc> {
        self.t0 + Duration::seconds(secs)
    }

    async fn send(&mut self, request: IntakeRequest, secs: i64) {
        let now = self.at(secs);
        self.tracker.handle(request, now).await.unwrap();
    }
}

fn page(item: u64) -> PageContext {
    testing::context(item)
}

#[tokio::test]
async fn page_close_ends_exactly_once_with_exact_duration() {
    // Scenario: close event at t=120s while active
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(&dir);
    h.authority.push_ok(Some("srv-1"));

    h.send(
        IntakeRequest::PageDetected { context: page(1) },
        0,
    )
    .await;
    h.send(
        IntakeRequest::PageClosed {
            context: page(1),
            duration_seconds: Some(120),
        },
        120,
    )
    .await;
    // duplicate event delivery
    h.send(
        IntakeRequest::PageClosed {
            context: page(1),
            duration_seconds: Some(120),
        },
        121,
    )
    .await;

    let doc = h.registry.store().load().unwrap();
    assert!(doc.sessions.is_empty());
    assert_eq!(doc.history.len(), 1);
    assert_eq!(doc.history[0].duration_seconds, Some(120));
    assert_eq!(doc.history[0].end_reason, Some(EndReason::TabClosed));

    let ends: Vec<_> = h
        .authority
        .seen()
        .into_iter()
        .filter(|i| i.kind == MutationKind::EndSession)
        .collect();
    assert_eq!(ends.len(), 1);
}

#[tokio::test]
async fn review_submitted_while_paused_excludes_the_pause() {
    // Scenario: submit arrives 10s after visibility-hidden
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(&dir);

    h.send(IntakeRequest::PageDetected { context: page(2) }, 0).await;
    h.send(
        IntakeRequest::VisibilityChanged {
            context: page(2),
            hidden: true,
        },
        90,
    )
    .await;
    h.send(IntakeRequest::ReviewSubmitted { context: page(2) }, 100)
        .await;

    let doc = h.registry.store().load().unwrap();
    assert_eq!(doc.history.len(), 1);
    assert_eq!(doc.history[0].duration_seconds, Some(90));
    assert_eq!(doc.history[0].end_reason, Some(EndReason::ReviewSubmitted));
}

#[tokio::test]
async fn offline_end_is_delivered_in_order_after_reconnect() {
    // Scenario: session ends offline; reconnect drains create then end
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(&dir);

    h.send(IntakeRequest::Connectivity { online: false }, 0).await;
    h.send(IntakeRequest::PageDetected { context: page(3) }, 1).await;
    h.send(
        IntakeRequest::PageClosed {
            context: page(3),
            duration_seconds: None,
        },
        61,
    )
    .await;

    assert!(h.authority.seen().is_empty());
    let doc = h.registry.store().load().unwrap();
    assert_eq!(doc.queue.len(), 2);
    assert!(doc.offline);

    h.authority.push_ok(Some("srv-77"));
    h.authority.push_ok(None);
    h.send(IntakeRequest::Connectivity { online: true }, 120).await;

    let kinds: Vec<_> = h.authority.seen().iter().map(|i| i.kind).collect();
    assert_eq!(
        kinds,
        vec![MutationKind::CreateSession, MutationKind::EndSession]
    );

    let doc = h.registry.store().load().unwrap();
    assert!(doc.queue.is_empty());
    assert!(!doc.offline);
    let session = &doc.history[0];
    assert!(session.synced);
    assert_eq!(session.remote_id.as_deref(), Some("srv-77"));
    assert_eq!(doc.last_sync_at, Some(h.at(120)));
}

#[tokio::test]
async fn sequential_sessions_never_exceed_wall_clock_span() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(&dir);

    h.send(IntakeRequest::PageDetected { context: page(4) }, 0).await;
    h.send(
        IntakeRequest::PageClosed {
            context: page(4),
            duration_seconds: None,
        },
        100,
    )
    .await;
    h.send(IntakeRequest::PageDetected { context: page(4) }, 110).await;
    h.send(
        IntakeRequest::PageClosed {
            context: page(4),
            duration_seconds: None,
        },
        200,
    )
    .await;

    let doc = h.registry.store().load().unwrap();
    let total: i64 = doc
        .history
        .iter()
        .map(|s| s.duration_seconds.unwrap_or(0))
        .sum();
    // wall-clock span is 200s; 5s tolerance
    assert!(total <= 205, "total {total} exceeds wall-clock span");
    assert_eq!(doc.history.len(), 2);
    for session in &doc.history {
        assert!(session.ended_at.unwrap() >= session.started_at);
    }
}

#[tokio::test]
async fn reopening_the_same_page_starts_a_fresh_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(&dir);

    h.send(IntakeRequest::PageDetected { context: page(5) }, 0).await;
    let first_id = h.registry.active_sessions().unwrap()[0].id.clone();
    h.send(
        IntakeRequest::PageClosed {
            context: page(5),
            duration_seconds: None,
        },
        50,
    )
    .await;
    h.send(IntakeRequest::PageDetected { context: page(5) }, 60).await;

    let active = h.registry.active_sessions().unwrap();
    assert_eq!(active.len(), 1);
    assert_ne!(active[0].id, first_id);
}

#[tokio::test]
async fn activity_pings_keep_a_session_alive_across_sweeps() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(&dir);

    h.send(IntakeRequest::PageDetected { context: page(6) }, 0).await;
    h.send(IntakeRequest::ActivityPing { context: page(6) }, 290).await;

    // sweep at t=320: only 30s idle thanks to the ping
    h.tracker.sweep(h.at(320)).await.unwrap();
    assert_eq!(h.registry.active_sessions().unwrap().len(), 1);

    // no more pings; sweep at t=620 reaps it
    h.tracker.sweep(h.at(620)).await.unwrap();
    assert!(h.registry.active_sessions().unwrap().is_empty());

    let doc = h.registry.store().load().unwrap();
    assert_eq!(doc.history[0].end_reason, Some(EndReason::Inactivity));
}

#[tokio::test]
async fn status_requests_do_not_trigger_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(&dir);

    h.send(IntakeRequest::Connectivity { online: false }, 0).await;
    h.send(IntakeRequest::PageDetected { context: page(8) }, 1).await;
    // back online without the reconnect drain
    h.registry.set_offline(false).unwrap();

    h.send(IntakeRequest::Status, 10).await;
    assert!(h.authority.seen().is_empty());
    assert_eq!(h.registry.store().load().unwrap().queue.len(), 1);

    h.authority.push_ok(Some("srv-8"));
    h.send(IntakeRequest::Sync, 20).await;
    assert_eq!(h.authority.seen().len(), 1);
    assert!(h.registry.store().load().unwrap().queue.is_empty());
}

#[tokio::test]
async fn manual_sync_retries_parked_mutations() {
    // the authority fails until the create parks; a manual sync from a
    // display surface revives it and it finally lands
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(&dir);

    h.authority
        .push_err(ApiError::Transient("gateway drain".into()));
    h.send(IntakeRequest::PageDetected { context: page(9) }, 0).await;
    for secs in [10, 20] {
        h.authority
            .push_err(ApiError::Transient("gateway drain".into()));
        h.send(IntakeRequest::Sync, secs).await;
    }
    assert_eq!(h.registry.store().load().unwrap().queue.parked(), 1);

    h.authority.push_ok(Some("srv-9"));
    h.send(IntakeRequest::Sync, 30).await;

    let doc = h.registry.store().load().unwrap();
    assert!(doc.queue.is_empty());
    let session = h.registry.active_sessions().unwrap();
    assert!(session[0].synced);
    assert_eq!(session[0].remote_id.as_deref(), Some("srv-9"));
}

#[tokio::test]
async fn tracker_restart_rebuilds_from_the_durable_store() {
    let dir = tempfile::tempdir().unwrap();
    let t0;
    {
        let mut h = Harness::new(&dir);
        t0 = h.t0;
        h.send(IntakeRequest::Connectivity { online: false }, 0).await;
        h.send(IntakeRequest::PageDetected { context: page(7) }, 1).await;
    }

    // a fresh process over the same store picks the session up
    let store = Store::new(dir.path().join("state.json"));
    let registry = SessionRegistry::new(store.clone());
    let authority = ScriptedAuthority::default();
    let dispatcher = SyncDispatcher::new(store, authority.clone(), NoTokens, 3);
    let mut tracker = Tracker::new(registry.clone(), ActivityMonitor::new(5), dispatcher, 300);

    authority.push_ok(Some("srv-5"));
    authority.push_ok(None);
    tracker
        .handle(
            IntakeRequest::Connectivity { online: true },
            t0 + Duration::seconds(30),
        )
        .await
        .unwrap();
    tracker
        .handle(
            IntakeRequest::PageClosed {
                context: page(7),
                duration_seconds: None,
            },
            t0 + Duration::seconds(61),
        )
        .await
        .unwrap();

    let doc = registry.store().load().unwrap();
    assert!(doc.queue.is_empty());
    assert_eq!(doc.history.len(), 1);
    assert_eq!(doc.history[0].duration_seconds, Some(60));
    assert_eq!(doc.history[0].remote_id.as_deref(), Some("srv-5"));
    assert!(doc.history[0].synced);
}
