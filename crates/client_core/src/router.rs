use shared::protocol::TopicPayload;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    destinations::USER_PREFIX,
    event_bus::{BusEvent, EventBus},
};

/// Server push categories this client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    MessageReceived,
    MessageUnsent,
    MessageReact,
    UserOnlineStatus,
    ConversationCreated,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::MessageReceived,
        Topic::MessageUnsent,
        Topic::MessageReact,
        Topic::UserOnlineStatus,
        Topic::ConversationCreated,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::MessageReceived => "message.received",
            Self::MessageUnsent => "message.unsent",
            Self::MessageReact => "message.react",
            Self::UserOnlineStatus => "user.onlineStatus",
            Self::ConversationCreated => "conversation.created",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|topic| topic.key() == key)
    }

    pub fn decode(self, body: &[u8]) -> serde_json::Result<TopicPayload> {
        match self {
            Self::MessageReceived => serde_json::from_slice(body).map(TopicPayload::NewMessage),
            Self::MessageUnsent => serde_json::from_slice(body).map(TopicPayload::MessageUnsent),
            Self::MessageReact => serde_json::from_slice(body).map(TopicPayload::MessageReaction),
            Self::UserOnlineStatus => serde_json::from_slice(body).map(TopicPayload::UserPresence),
            Self::ConversationCreated => {
                serde_json::from_slice(body).map(TopicPayload::ConversationCreated)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no handler for topic {topic:?} (destination {destination:?})")]
    UnknownTopic { destination: String, topic: String },
    #[error("malformed {topic} payload: {source}")]
    MalformedPayload {
        topic: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Strips the server's `/user` prefix and the queue/topic segment.
///
/// `/user/queue/message.received` and `/topic/message.received` both become
/// `message.received`.
pub fn normalize_topic(destination: &str) -> &str {
    let destination = destination.trim();
    let without_user = match destination.strip_prefix(USER_PREFIX) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => destination,
    };
    ["/queue/", "/topic/", "/"]
        .into_iter()
        .find_map(|prefix| without_user.strip_prefix(prefix))
        .unwrap_or(without_user)
}

#[derive(Debug, Clone)]
pub struct TopicRouter {
    bus: EventBus,
}

impl TopicRouter {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Decodes a push and emits it. Failures are logged and returned; they never
    /// affect later frames.
    pub fn dispatch(&self, destination: &str, body: &[u8]) -> Result<Topic, RouteError> {
        let normalized = normalize_topic(destination);
        let Some(topic) = Topic::from_key(normalized) else {
            warn!(destination, topic = normalized, "router: dropping frame for unknown topic");
            return Err(RouteError::UnknownTopic {
                destination: destination.to_string(),
                topic: normalized.to_string(),
            });
        };

        let payload = topic.decode(body).map_err(|source| {
            warn!(destination, topic = topic.key(), error = %source, "router: dropping malformed payload");
            RouteError::MalformedPayload {
                topic: topic.key(),
                source,
            }
        })?;

        debug!(topic = topic.key(), "router: dispatching");
        self.bus.emit(BusEvent::Topic(payload));
        Ok(topic)
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
