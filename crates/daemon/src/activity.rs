//! Activity Monitor: debounced liveness updates and visibility transitions.
//!
//! Upstream signals are already coalesced per DOM window, but the debounce
//! state lives here as an owned unit (last accepted ping per page + fixed
//! window) rather than as ambient module state; it is a disposable cache and
//! safe to lose on restart, since it only suppresses extra disk writes.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use revclock_core::PageContext;

use crate::registry::SessionRegistry;

fn page_key(context: &PageContext) -> String {
    format!(
        "{}/{}#{}",
        context.owner, context.name, context.item_number
    )
}

pub struct ActivityMonitor {
    window: Duration,
    last_accepted: HashMap<String, DateTime<Utc>>,
}

impl ActivityMonitor {
    pub fn new(debounce_secs: u64) -> Self {
        Self {
            window: Duration::seconds(debounce_secs as i64),
            last_accepted: HashMap::new(),
        }
    }

    /// Handles one activity ping. Returns true when the ping was persisted,
    /// false when it was dropped (debounce window or unknown page). The
    /// update is written to the store before this returns; the process may be
    /// torn down right after.
    pub fn on_activity(
        &mut self,
        registry: &SessionRegistry,
        context: &PageContext,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let key = page_key(context);
        if let Some(last) = self.last_accepted.get(&key) {
            if now - *last < self.window {
                debug!("activity ping for {key} inside debounce window, dropped");
                return Ok(false);
            }
        }

        let known = registry.touch_page(context, now)?;
        if known {
            self.last_accepted.insert(key, now);
        }
        Ok(known)
    }

    /// Visibility change: hidden pauses the session, visible resumes it.
    pub fn on_visibility(
        &mut self,
        registry: &SessionRegistry,
        context: &PageContext,
        hidden: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if hidden {
            registry.pause_page(context, now)
        } else {
            registry.resume_page(context, now)
        }
    }
}
