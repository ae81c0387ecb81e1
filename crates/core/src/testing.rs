use chrono::{DateTime, Utc};

use crate::session::{PageContext, TrackingSession};

/// Page context for the `acme/widgets` repository at the given item number.
pub fn context(item_number: u64) -> PageContext {
    PageContext {
        url: format!("https://example.com/acme/widgets/pull/{item_number}"),
        owner: "acme".to_string(),
        name: "widgets".to_string(),
        item_number,
        title: None,
        branch: None,
    }
}

/// Active session started at `now` for [`context`].
pub fn session(item_number: u64, now: DateTime<Utc>) -> TrackingSession {
    TrackingSession::new(context(item_number), now)
}
