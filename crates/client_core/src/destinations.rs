//! Well-known socket destinations.

use crate::router::Topic;

/// Prefix the server adds to per-user deliveries.
pub const USER_PREFIX: &str = "/user";
pub const HEARTBEAT: &str = "/app/heartbeat";
pub const TYPING: &str = "/app/typing";
pub const USER_ACTIVITY: &str = "/app/user.activity";
pub const CALL_SIGNAL: &str = "/app/call.signal";

/// Per-user queue a topic is delivered on, e.g. `/user/queue/message.received`.
pub fn user_queue(topic: Topic) -> String {
    format!("{USER_PREFIX}/queue/{}", topic.key())
}
