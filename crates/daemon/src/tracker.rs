//! The tracker event loop: the single writer of the durable store.
//!
//! All mutation paths (intake requests, the reaper tick, the sync tick) run
//! on this one task; display surfaces only ever read. Errors inside the loop
//! are logged and the event dropped; prior persisted state stays intact.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use revclock_core::EndReason;

use crate::activity::ActivityMonitor;
use crate::dispatcher::{Authority, SyncDispatcher, TokenProvider};
use crate::events::IntakeRequest;
use crate::reaper;
use crate::registry::SessionRegistry;

pub struct Tracker<A, T> {
    registry: SessionRegistry,
    monitor: ActivityMonitor,
    dispatcher: SyncDispatcher<A, T>,
    idle_threshold: Duration,
}

impl<A: Authority, T: TokenProvider> Tracker<A, T> {
    pub fn new(
        registry: SessionRegistry,
        monitor: ActivityMonitor,
        dispatcher: SyncDispatcher<A, T>,
        idle_threshold_secs: u64,
    ) -> Self {
        Self {
            registry,
            monitor,
            dispatcher,
            idle_threshold: Duration::seconds(idle_threshold_secs as i64),
        }
    }

    /// Applies one intake request. Mutations are persisted before any sync
    /// attempt, so a teardown right after still ends up consistent.
    pub async fn handle(&mut self, request: IntakeRequest, now: DateTime<Utc>) -> Result<()> {
        match request {
            IntakeRequest::PageDetected { context } => {
                self.registry.start(context, now)?;
                self.sync(now).await
            }
            IntakeRequest::ActivityPing { context } => {
                self.monitor.on_activity(&self.registry, &context, now)?;
                Ok(())
            }
            IntakeRequest::VisibilityChanged { context, hidden } => {
                self.monitor
                    .on_visibility(&self.registry, &context, hidden, now)?;
                Ok(())
            }
            IntakeRequest::PageClosed {
                context,
                duration_seconds,
            } => {
                let ended =
                    self.registry
                        .end_page(&context, EndReason::TabClosed, now, duration_seconds)?;
                if ended.is_some() {
                    self.sync(now).await?;
                }
                Ok(())
            }
            IntakeRequest::ReviewSubmitted { context } => {
                let ended =
                    self.registry
                        .end_page(&context, EndReason::ReviewSubmitted, now, None)?;
                if ended.is_some() {
                    self.sync(now).await?;
                }
                Ok(())
            }
            IntakeRequest::Connectivity { online } => {
                self.registry.set_offline(!online)?;
                if online {
                    // drain what piled up while offline
                    self.sync(now).await?;
                }
                Ok(())
            }
            IntakeRequest::Sync => {
                // the operator's retry: parked mutations get another chance
                let revived = self.dispatcher.revive_parked()?;
                if revived > 0 {
                    info!("manual sync revived {revived} parked mutation(s)");
                }
                self.sync(now).await
            }
            IntakeRequest::Status => {
                // answered inline by the intake listener; nothing to do here
                debug!("status request reached the tracker loop");
                Ok(())
            }
        }
    }

    /// One reaper sweep followed by a sync when anything closed.
    pub async fn sweep(&mut self, now: DateTime<Utc>) -> Result<()> {
        let closed = reaper::sweep(&self.registry, self.idle_threshold, now)?;
        if !closed.is_empty() {
            info!("reaper closed {} idle session(s)", closed.len());
            self.sync(now).await?;
        }
        Ok(())
    }

    pub async fn sync(&mut self, now: DateTime<Utc>) -> Result<()> {
        let report = self.dispatcher.process(now).await?;
        if report.delivered + report.conflicts + report.parked > 0 {
            info!(
                delivered = report.delivered,
                conflicts = report.conflicts,
                deferred = report.deferred,
                parked = report.parked,
                "sync pass finished"
            );
        }
        Ok(())
    }
}

/// Runs the tracker until shutdown: intake requests as they arrive, the
/// reaper on its interval, and a periodic sync as a safety net for wake-ups
/// missed while suspended.
pub async fn run_tracker<A: Authority, T: TokenProvider>(
    mut tracker: Tracker<A, T>,
    reaper_interval_secs: u64,
    sync_interval_secs: u64,
    mut rx: mpsc::UnboundedReceiver<IntakeRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reaper_tick =
        tokio::time::interval(std::time::Duration::from_secs(reaper_interval_secs.max(1)));
    let mut sync_tick =
        tokio::time::interval(std::time::Duration::from_secs(sync_interval_secs.max(1)));
    // both fire immediately once; skip that
    reaper_tick.tick().await;
    sync_tick.tick().await;

    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else { break };
                debug!(?request, "intake request");
                if let Err(e) = tracker.handle(request, Utc::now()).await {
                    error!("failed to handle intake request: {e:#}");
                }
            }
            _ = reaper_tick.tick() => {
                if let Err(e) = tracker.sweep(Utc::now()).await {
                    error!("reaper sweep failed: {e:#}");
                }
            }
            _ = sync_tick.tick() => {
                if let Err(e) = tracker.sync(Utc::now()).await {
                    error!("periodic sync failed: {e:#}");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("tracker shutting down");
                    break;
                }
            }
        }
    }
}
