use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::session::TrackingSession;

/// What a queued mutation does to the remote authority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    CreateSession,
    EndSession,
    UpdateSession,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Patch,
    Put,
}

/// One pending mutation destined for the remote authority.
///
/// Items for the same session are delivered in enqueue order; the queue never
/// reorders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncQueueItem {
    pub id: String,
    pub session_id: String,
    pub kind: MutationKind,
    pub method: HttpMethod,
    pub endpoint: String,
    pub body: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    /// Backoff deadline; the dispatcher skips the item until it passes.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parked: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    fn new(
        session: &TrackingSession,
        kind: MutationKind,
        method: HttpMethod,
        endpoint: String,
        body: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            kind,
            method,
            endpoint,
            body,
            enqueued_at: now,
            attempts: 0,
            not_before: None,
            parked: false,
            last_error: None,
        }
    }

    /// Mutation announcing a freshly started session.
    pub fn create(session: &TrackingSession, now: DateTime<Utc>) -> Self {
        let body = json!({
            "local_id": session.id,
            "owner": session.context.owner,
            "name": session.context.name,
            "item_number": session.context.item_number,
            "title": session.context.title,
            "branch": session.context.branch,
            "started_at": session.started_at,
        });
        Self::new(
            session,
            MutationKind::CreateSession,
            HttpMethod::Post,
            "/sessions".to_string(),
            body,
            now,
        )
    }

    /// Mutation closing a session with its final duration.
    pub fn end(session: &TrackingSession, now: DateTime<Utc>) -> Self {
        let body = json!({
            "local_id": session.id,
            "duration_seconds": session.duration_seconds,
            "ended_at": session.ended_at,
            "end_reason": session.end_reason,
        });
        Self::new(
            session,
            MutationKind::EndSession,
            HttpMethod::Patch,
            format!("/sessions/{}", session.id),
            body,
            now,
        )
    }

    /// Mutation refreshing mutable session fields (title, branch).
    pub fn update(session: &TrackingSession, now: DateTime<Utc>) -> Self {
        let body = json!({
            "local_id": session.id,
            "title": session.context.title,
            "branch": session.context.branch,
        });
        Self::new(
            session,
            MutationKind::UpdateSession,
            HttpMethod::Put,
            format!("/sessions/{}", session.id),
            body,
            now,
        )
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.parked && self.not_before.map_or(true, |t| t <= now)
    }
}

/// Delay before the next delivery attempt, in seconds: 1, 2, 4, 8, capped at 16.
pub fn backoff_delay_secs(attempts: u32) -> u64 {
    1u64 << attempts.min(4)
}

/// Ordered, durable list of pending mutations. Append-only at the back,
/// removal anywhere by id; relative order is never changed, which is what
/// guarantees per-session FIFO delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct SyncQueue {
    items: Vec<SyncQueueItem>,
}

impl SyncQueue {
    pub fn enqueue(&mut self, item: SyncQueueItem) {
        self.items.push(item);
    }

    pub fn front(&self) -> Option<&SyncQueueItem> {
        self.items.first()
    }

    pub fn remove(&mut self, id: &str) -> Option<SyncQueueItem> {
        let idx = self.items.iter().position(|item| item.id == id)?;
        Some(self.items.remove(idx))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SyncQueueItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncQueueItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Count of items awaiting delivery (not parked).
    pub fn pending(&self) -> usize {
        self.items.iter().filter(|item| !item.parked).count()
    }

    /// Count of items parked after exhausting retries.
    pub fn parked(&self) -> usize {
        self.items.iter().filter(|item| item.parked).count()
    }

    /// Clears parked flags and retry state so delivery can be attempted
    /// again. `last_error` is kept for diagnostics. Returns the number of
    /// items revived.
    pub fn revive_parked(&mut self) -> usize {
        let mut revived = 0;
        for item in &mut self.items {
            if item.parked {
                item.parked = false;
                item.attempts = 0;
                item.not_before = None;
                revived += 1;
            }
        }
        revived
    }

    /// Whether an earlier item for the same session sits in front of `item`.
    pub fn has_earlier_for_session(&self, item: &SyncQueueItem) -> bool {
        self.items
            .iter()
            .take_while(|other| other.id != item.id)
            .any(|other| other.session_id == item.session_id)
    }
}
