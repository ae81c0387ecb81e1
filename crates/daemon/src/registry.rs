//! Session Registry: the only component that mutates session state.
//!
//! The hosting process is not durable between events, so every operation here
//! re-reads the persisted document, mutates it, and saves it before
//! returning. Nothing is cached across calls; correctness under concurrent
//! triggers (timeout vs. close vs. submit) comes from `end` being idempotent,
//! not from locking.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use revclock_core::{EndReason, PageContext, SyncQueueItem, TrackingSession};
use revclock_store::Store;

/// Result of a `start` call.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(TrackingSession),
    /// A session was already active for this page; the existing one is
    /// returned instead of creating a duplicate.
    AlreadyActive(TrackingSession),
}

impl StartOutcome {
    pub fn session(&self) -> &TrackingSession {
        match self {
            StartOutcome::Started(s) | StartOutcome::AlreadyActive(s) => s,
        }
    }
}

/// Result of an `end` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOutcome {
    pub session_id: String,
    pub duration_seconds: i64,
    /// False when the session had already ended; no second mutation was
    /// enqueued in that case.
    pub newly_ended: bool,
}

/// Read-only snapshot handed to display surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub active: Vec<TrackingSession>,
    pub recent: Vec<TrackingSession>,
    pub queue_pending: usize,
    pub queue_parked: usize,
    pub offline: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    store: Store,
}

impl SessionRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Starts tracking a page. If a session is already active for the same
    /// page, no duplicate is created; a re-detection that carries fresh
    /// title/branch metadata refreshes the stored context and enqueues an
    /// update mutation instead.
    pub fn start(&self, context: PageContext, now: DateTime<Utc>) -> Result<StartOutcome> {
        let mut doc = self.store.load()?;

        if let Some(existing) = doc.active_for_page(&context) {
            let id = existing.id.clone();
            let metadata_changed = existing.context.title != context.title
                || existing.context.branch != context.branch;
            if !metadata_changed {
                debug!(
                    session = %id,
                    "session already active for {}/{}#{}",
                    context.owner, context.name, context.item_number
                );
                return Ok(StartOutcome::AlreadyActive(existing.clone()));
            }
            let session = doc.sessions.get_mut(&id).expect("session was just found");
            session.context.url = context.url;
            session.context.title = context.title;
            session.context.branch = context.branch;
            session.synced = false;
            let refreshed = session.clone();
            doc.queue.enqueue(SyncQueueItem::update(&refreshed, now));
            debug!(session = %id, "page metadata refreshed");
            self.store.save(&doc).context("persist metadata update")?;
            return Ok(StartOutcome::AlreadyActive(refreshed));
        }

        let session = TrackingSession::new(context, now);
        info!(
            session = %session.id,
            "session started for {}/{}#{}",
            session.context.owner, session.context.name, session.context.item_number
        );
        doc.queue.enqueue(SyncQueueItem::create(&session, now));
        doc.sessions.insert(session.id.clone(), session.clone());
        self.store.save(&doc).context("persist started session")?;
        Ok(StartOutcome::Started(session))
    }

    /// Updates the liveness timestamp of the active session for a page.
    /// Returns false when no session is active for it.
    pub fn touch_page(&self, context: &PageContext, now: DateTime<Utc>) -> Result<bool> {
        let mut doc = self.store.load()?;
        let Some(id) = doc.active_for_page(context).map(|s| s.id.clone()) else {
            return Ok(false);
        };
        if let Some(session) = doc.sessions.get_mut(&id) {
            session.touch(now);
        }
        self.store.save(&doc).context("persist activity update")?;
        Ok(true)
    }

    /// Suspends the active session for a page (visibility hidden). No-op when
    /// already paused.
    pub fn pause_page(&self, context: &PageContext, now: DateTime<Utc>) -> Result<bool> {
        let mut doc = self.store.load()?;
        let Some(id) = doc.active_for_page(context).map(|s| s.id.clone()) else {
            return Ok(false);
        };
        let session = doc.sessions.get_mut(&id).expect("session was just found");
        let changed = session.pause(now);
        if changed {
            debug!(session = %id, "paused");
            self.store.save(&doc).context("persist pause")?;
        }
        Ok(changed)
    }

    /// Resumes the active session for a page (visibility visible). No-op when
    /// not paused.
    pub fn resume_page(&self, context: &PageContext, now: DateTime<Utc>) -> Result<bool> {
        let mut doc = self.store.load()?;
        let Some(id) = doc.active_for_page(context).map(|s| s.id.clone()) else {
            return Ok(false);
        };
        let session = doc.sessions.get_mut(&id).expect("session was just found");
        let changed = session.resume(now);
        if changed {
            debug!(session = %id, "resumed");
            self.store.save(&doc).context("persist resume")?;
        }
        Ok(changed)
    }

    /// Terminates a session by id. Idempotent: an already-ended session
    /// returns its stored duration and enqueues nothing.
    pub fn end(
        &self,
        id: &str,
        reason: EndReason,
        now: DateTime<Utc>,
        override_seconds: Option<i64>,
    ) -> Result<Option<EndOutcome>> {
        let mut doc = self.store.load()?;

        if let Some(session) = doc.sessions.get_mut(id) {
            let duration = session.end(reason, now, override_seconds);
            let item = SyncQueueItem::end(session, now);
            info!(session = %id, duration, ?reason, "session ended");
            doc.queue.enqueue(item);
            doc.retire(id);
            self.store.save(&doc).context("persist ended session")?;
            return Ok(Some(EndOutcome {
                session_id: id.to_string(),
                duration_seconds: duration,
                newly_ended: true,
            }));
        }

        // Lost the race against another termination trigger: report the
        // stored result without touching the queue.
        if let Some(session) = doc.session(id) {
            if session.is_ended() {
                return Ok(Some(EndOutcome {
                    session_id: id.to_string(),
                    duration_seconds: session.duration_seconds.unwrap_or(0),
                    newly_ended: false,
                }));
            }
        }
        Ok(None)
    }

    /// Terminates whatever session is active for a page. Returns `None` when
    /// nothing is active (e.g. a duplicate close event).
    pub fn end_page(
        &self,
        context: &PageContext,
        reason: EndReason,
        now: DateTime<Utc>,
        override_seconds: Option<i64>,
    ) -> Result<Option<EndOutcome>> {
        let doc = self.store.load()?;
        let Some(id) = doc.active_for_page(context).map(|s| s.id.clone()) else {
            return Ok(None);
        };
        self.end(&id, reason, now, override_seconds)
    }

    /// Currently active sessions.
    pub fn active_sessions(&self) -> Result<Vec<TrackingSession>> {
        let doc = self.store.load()?;
        Ok(doc.sessions.values().cloned().collect())
    }

    /// Flips the offline flag. Returns true when the value changed.
    pub fn set_offline(&self, offline: bool) -> Result<bool> {
        let mut doc = self.store.load()?;
        if doc.offline == offline {
            return Ok(false);
        }
        doc.offline = offline;
        self.store.save(&doc).context("persist connectivity flag")?;
        info!("connectivity changed: {}", if offline { "offline" } else { "online" });
        Ok(true)
    }

    /// Read-only snapshot for a display surface.
    pub fn snapshot(&self) -> Result<TrackerSnapshot> {
        let doc = self.store.load()?;
        let mut active: Vec<_> = doc.sessions.values().cloned().collect();
        active.sort_by_key(|s| s.started_at);
        let recent: Vec<_> = doc.history.iter().rev().take(20).cloned().collect();
        Ok(TrackerSnapshot {
            active,
            recent,
            queue_pending: doc.queue.pending(),
            queue_parked: doc.queue.parked(),
            offline: doc.offline,
            last_sync_at: doc.last_sync_at,
        })
    }
}
