//! Wall-clock timestamps stamped onto outgoing messages.
//!
//! Timestamps are informational only. Receivers use them to break ties when
//! smoothing, never to order messages.

use chrono::Utc;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
