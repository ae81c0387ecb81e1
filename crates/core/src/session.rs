use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata of the review page a session is measuring.
///
/// Two contexts identify the same logical page when owner, name and item
/// number all match; url and title are display-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageContext {
    pub url: String,
    pub owner: String,
    pub name: String,
    pub item_number: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

impl PageContext {
    /// Whether two contexts refer to the same review page.
    pub fn same_page(&self, other: &PageContext) -> bool {
        self.owner == other.owner && self.name == other.name && self.item_number == other.item_number
    }
}

/// Why a session was terminated. Diagnostics only; never affects the
/// computed duration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Inactivity,
    TabClosed,
    ReviewSubmitted,
}

/// One continuous review-time measurement for one page context.
///
/// Paused intervals are excluded from the duration by advancing
/// `effective_started_at` on resume by the length of the pause, so the
/// elapsed time is always `now - effective_started_at` while active and
/// `paused_at - effective_started_at` while paused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingSession {
    pub id: String,
    /// Assigned by the remote authority on create acknowledgment. Never
    /// synthesized locally.
    #[serde(default)]
    pub remote_id: Option<String>,
    pub context: PageContext,
    pub started_at: DateTime<Utc>,
    /// Start reference used for duration math; moves forward on resume.
    pub effective_started_at: DateTime<Utc>,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
    pub active: bool,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub end_reason: Option<EndReason>,
}

impl TrackingSession {
    pub fn new(context: PageContext, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_id: None,
            context,
            started_at: now,
            effective_started_at: now,
            paused_at: None,
            ended_at: None,
            duration_seconds: None,
            last_activity_at: None,
            active: true,
            synced: false,
            end_reason: None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn is_paused(&self) -> bool {
        !self.is_ended() && self.paused_at.is_some()
    }

    /// Seconds of review time accumulated so far, excluding paused intervals.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        let reference = match (self.ended_at, self.paused_at) {
            (Some(ended), _) => ended,
            (None, Some(paused)) => paused,
            (None, None) => now,
        };
        (reference - self.effective_started_at).num_seconds().max(0)
    }

    /// Seconds since the last sign of life (falls back to the start time when
    /// no activity was ever recorded).
    pub fn idle_seconds(&self, now: DateTime<Utc>) -> i64 {
        let last = self.last_activity_at.unwrap_or(self.started_at);
        (now - last).num_seconds().max(0)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if !self.is_ended() {
            self.last_activity_at = Some(now);
        }
    }

    /// Suspends measurement. Returns false when already paused or ended.
    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_ended() || self.paused_at.is_some() {
            return false;
        }
        self.paused_at = Some(now);
        self.active = false;
        true
    }

    /// Resumes measurement, discarding the paused interval from the duration.
    /// Returns false when not paused or already ended.
    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_ended() {
            return false;
        }
        let Some(paused) = self.paused_at.take() else {
            return false;
        };
        self.effective_started_at += now - paused;
        self.active = true;
        self.last_activity_at = Some(now);
        true
    }

    /// Terminates the session and computes its duration. Idempotent: an
    /// already-ended session keeps its stored duration and reason.
    ///
    /// `override_seconds` wins over the computed elapsed time when the caller
    /// measured the duration itself (page-close events do).
    pub fn end(
        &mut self,
        reason: EndReason,
        now: DateTime<Utc>,
        override_seconds: Option<i64>,
    ) -> i64 {
        if let Some(duration) = self.duration_seconds {
            return duration;
        }
        let duration = override_seconds.unwrap_or_else(|| self.elapsed_seconds(now));
        // end_time >= start_time even for clock skew or a zero override
        let ended_at = now.max(self.started_at);
        self.duration_seconds = Some(duration.max(0));
        self.ended_at = Some(ended_at);
        self.paused_at = None;
        self.active = false;
        self.end_reason = Some(reason);
        // a new end-session mutation now awaits acknowledgment
        self.synced = false;
        self.duration_seconds.unwrap_or(0)
    }
}
