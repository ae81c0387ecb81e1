//! Sync Dispatcher: drains the durable mutation queue against the remote
//! authority.
//!
//! The queue is walked in order. A session becomes blocked for the rest of
//! the pass as soon as one of its items is parked, backing off, or fails, so
//! per-session FIFO delivery holds even across connectivity gaps; unrelated
//! sessions keep making progress past a stuck item. All retry state
//! (attempt counters, backoff deadlines, parked flags) is persisted with the
//! items, so pacing survives process teardown.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use revclock_api_client::{ApiClient, ApiError, DeliveryAck};
use revclock_core::{MutationKind, SyncQueueItem, backoff_delay_secs};
use revclock_store::Store;

/// Delivery side of the remote authority. `ApiClient` is the production
/// implementation; tests substitute a scripted one.
#[allow(async_fn_in_trait)]
pub trait Authority {
    async fn deliver(&self, item: &SyncQueueItem) -> Result<DeliveryAck, ApiError>;
    fn set_token(&mut self, token: String);
}

impl Authority for ApiClient {
    async fn deliver(&self, item: &SyncQueueItem) -> Result<DeliveryAck, ApiError> {
        ApiClient::deliver(self, item).await
    }

    fn set_token(&mut self, token: String) {
        self.set_auth(token);
    }
}

/// The token-exchange collaborator. Asked for a fresh token at most once per
/// `process` pass, when the authority reports expired credentials.
#[allow(async_fn_in_trait)]
pub trait TokenProvider {
    async fn refresh(&mut self) -> Result<String>;
}

/// What one `process` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub delivered: usize,
    /// Items the remote resolved authoritatively (already ended / unknown).
    pub conflicts: usize,
    /// Items skipped this pass (backoff, blocked session, offline).
    pub deferred: usize,
    /// Items newly parked after exhausting their attempts.
    pub parked: usize,
}

pub struct SyncDispatcher<A, T> {
    store: Store,
    authority: A,
    tokens: T,
    max_attempts: u32,
}

impl<A: Authority, T: TokenProvider> SyncDispatcher<A, T> {
    pub fn new(store: Store, authority: A, tokens: T, max_attempts: u32) -> Self {
        Self {
            store,
            authority,
            tokens,
            max_attempts,
        }
    }

    /// Drains deliverable queue items. Returns early when offline. Each
    /// item's outcome is persisted before the next is attempted, so teardown
    /// between items loses nothing.
    pub async fn process(&mut self, now: DateTime<Utc>) -> Result<ProcessReport> {
        let mut report = ProcessReport::default();

        let doc = self.store.load()?;
        if doc.offline {
            debug!("offline, sync deferred");
            return Ok(report);
        }
        let order: Vec<(String, String)> = doc
            .queue
            .iter()
            .map(|item| (item.id.clone(), item.session_id.clone()))
            .collect();
        drop(doc);

        let mut blocked: HashSet<String> = HashSet::new();
        let mut refreshed = false;

        for (item_id, session_id) in order {
            if blocked.contains(&session_id) {
                report.deferred += 1;
                continue;
            }

            // freshest persisted state, not the snapshot from loop entry
            let doc = self.store.load()?;
            if doc.offline {
                break;
            }
            let Some(item) = doc.queue.iter().find(|i| i.id == item_id) else {
                continue;
            };
            if item.parked {
                // a parked item keeps holding back later mutations of its session
                blocked.insert(session_id);
                continue;
            }
            if !item.is_due(now) {
                blocked.insert(session_id);
                report.deferred += 1;
                continue;
            }
            let item = item.clone();
            drop(doc);

            let mut result = self.authority.deliver(&item).await;

            if matches!(result, Err(ApiError::AuthExpired)) && !refreshed {
                refreshed = true;
                match self.tokens.refresh().await {
                    Ok(token) => {
                        info!("auth token refreshed, retrying delivery");
                        self.authority.set_token(token);
                        result = self.authority.deliver(&item).await;
                    }
                    Err(e) => {
                        warn!("token refresh failed: {e:#}");
                    }
                }
            }

            self.settle(&item, result, now, &mut report, &mut blocked)?;
        }

        Ok(report)
    }

    /// Clears parked flags so the next pass retries previously undeliverable
    /// items. The manual sync trigger calls this, giving operators a recovery
    /// path once the authority-side problem is resolved. Returns the number
    /// of items revived.
    pub fn revive_parked(&mut self) -> Result<usize> {
        let mut doc = self.store.load()?;
        let revived = doc.queue.revive_parked();
        if revived > 0 {
            info!("revived {revived} parked mutation(s) for retry");
            self.store.save(&doc)?;
        }
        Ok(revived)
    }

    /// Applies one delivery outcome to the durable document.
    fn settle(
        &self,
        item: &SyncQueueItem,
        result: Result<DeliveryAck, ApiError>,
        now: DateTime<Utc>,
        report: &mut ProcessReport,
        blocked: &mut HashSet<String>,
    ) -> Result<()> {
        let mut doc = self.store.load()?;

        match result {
            Ok(ack) => {
                doc.queue.remove(&item.id);
                // synced only once nothing for this session awaits delivery;
                // an acked create with its end still queued (or parked) is
                // not a synced session
                let fully_acked = !doc
                    .queue
                    .iter()
                    .any(|other| other.session_id == item.session_id);
                if let Some(session) = doc.session_mut(&item.session_id) {
                    if fully_acked {
                        session.synced = true;
                    }
                    if item.kind == MutationKind::CreateSession {
                        if let Some(remote_id) = ack.remote_id {
                            session.remote_id = Some(remote_id);
                        }
                    }
                }
                doc.last_sync_at = Some(now);
                debug!(item = %item.id, session = %item.session_id, "delivered");
                report.delivered += 1;
            }
            Err(ApiError::Conflict { status, body }) => {
                // The remote already knows the final state; keep the locally
                // computed duration and stop resending.
                info!(
                    session = %item.session_id,
                    "remote resolved mutation authoritatively (HTTP {status}): {body}"
                );
                doc.queue.remove(&item.id);
                let fully_acked = !doc
                    .queue
                    .iter()
                    .any(|other| other.session_id == item.session_id);
                if fully_acked {
                    if let Some(session) = doc.session_mut(&item.session_id) {
                        session.synced = true;
                    }
                }
                report.conflicts += 1;
            }
            Err(ApiError::Transient(message)) => {
                if let Some(queued) = doc.queue.get_mut(&item.id) {
                    queued.attempts += 1;
                    queued.last_error = Some(message.clone());
                    if queued.attempts >= self.max_attempts {
                        warn!(
                            item = %item.id,
                            attempts = queued.attempts,
                            "retry ceiling reached, parking: {message}"
                        );
                        queued.parked = true;
                        queued.not_before = None;
                        report.parked += 1;
                    } else {
                        let delay = backoff_delay_secs(queued.attempts) as i64;
                        queued.not_before = Some(now + Duration::seconds(delay));
                        debug!(
                            item = %item.id,
                            attempts = queued.attempts,
                            "transient failure, next attempt in {delay}s"
                        );
                        report.deferred += 1;
                    }
                }
                blocked.insert(item.session_id.clone());
            }
            Err(err @ (ApiError::AuthExpired | ApiError::Rejected { .. })) => {
                warn!(item = %item.id, "parking undeliverable mutation: {err}");
                if let Some(queued) = doc.queue.get_mut(&item.id) {
                    queued.attempts += 1;
                    queued.parked = true;
                    queued.last_error = Some(err.to_string());
                }
                report.parked += 1;
                blocked.insert(item.session_id.clone());
            }
        }

        self.store.save(&doc)?;
        Ok(())
    }
}
