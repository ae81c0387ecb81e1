//! Inactivity Reaper: closes sessions idle past the configured threshold.
//!
//! Runs from a periodic wake-up, not a per-session timer; repeated sweeps
//! over an already-ended session are harmless because `end` is idempotent,
//! which also makes the sweep safe against a page-close racing it.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use revclock_core::EndReason;

use crate::registry::{EndOutcome, SessionRegistry};

/// Sweeps all active sessions once, ending those idle longer than
/// `idle_threshold`. Returns the sessions this sweep actually closed.
pub fn sweep(
    registry: &SessionRegistry,
    idle_threshold: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<EndOutcome>> {
    let mut closed = Vec::new();

    for session in registry.active_sessions()? {
        let idle = session.idle_seconds(now);
        if idle <= idle_threshold.num_seconds() {
            continue;
        }
        info!(session = %session.id, idle, "closing idle session");
        if let Some(outcome) = registry.end(&session.id, EndReason::Inactivity, now, None)? {
            if outcome.newly_ended {
                closed.push(outcome);
            }
        }
    }

    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use revclock_core::testing;
    use revclock_store::Store;

    fn registry(dir: &tempfile::TempDir) -> SessionRegistry {
        SessionRegistry::new(Store::new(dir.path().join("state.json")))
    }

    #[test]
    fn sweep_closes_session_with_no_activity_ever() {
        // Scenario: started at t=0, no activity signal, sweep at t=300s
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let now = Utc::now();
        registry.start(testing::context(1), now).unwrap();

        let closed = sweep(
            &registry,
            Duration::minutes(5),
            now + Duration::seconds(301),
        )
        .unwrap();
        assert_eq!(closed.len(), 1);
        assert!((closed[0].duration_seconds - 300).abs() <= 30);

        let doc = registry.store().load().unwrap();
        assert!(doc.sessions.is_empty());
        assert_eq!(doc.history[0].end_reason, Some(EndReason::Inactivity));
    }

    #[test]
    fn sweep_spares_recently_active_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let now = Utc::now();
        let context = testing::context(1);
        registry.start(context.clone(), now).unwrap();
        registry
            .touch_page(&context, now + Duration::seconds(280))
            .unwrap();

        let closed = sweep(
            &registry,
            Duration::minutes(5),
            now + Duration::seconds(400),
        )
        .unwrap();
        assert!(closed.is_empty());
        assert_eq!(registry.active_sessions().unwrap().len(), 1);
    }

    #[test]
    fn repeated_sweeps_close_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let now = Utc::now();
        registry.start(testing::context(1), now).unwrap();

        let threshold = Duration::minutes(5);
        let first = sweep(&registry, threshold, now + Duration::seconds(600)).unwrap();
        let second = sweep(&registry, threshold, now + Duration::seconds(900)).unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn sweep_tolerates_a_racing_page_close() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        let now = Utc::now();
        let context = testing::context(1);
        registry.start(context.clone(), now).unwrap();

        // page close wins the race
        let closed_by_page = registry
            .end_page(&context, EndReason::TabClosed, now + Duration::seconds(120), None)
            .unwrap()
            .unwrap();

        let closed_by_sweep = sweep(
            &registry,
            Duration::minutes(5),
            now + Duration::seconds(600),
        )
        .unwrap();
        assert!(closed_by_sweep.is_empty());
        assert_eq!(closed_by_page.duration_seconds, 120);
    }
}
