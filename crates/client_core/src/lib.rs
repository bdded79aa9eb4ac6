//! Realtime sync core for the chat client: socket transport, framing,
//! heartbeat, push routing, offline outbox and paginated history.

pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod destinations;
pub mod error;
pub mod event_bus;
pub mod frame;
pub mod heartbeat;
pub mod message_window;
pub mod outbox;
pub mod router;

pub use api::{ChatApi, HttpChatApi, MessageCursor, MissingChatApi};
pub use auth::{AuthError, Credentials};
pub use config::Settings;
pub use connection::{
    ConnectionConfig, ConnectionHandle, ConnectionSnapshot, ConnectionStatus, ReconnectPolicy,
};
pub use error::ConnectionError;
pub use event_bus::{BusEvent, EventBus, ObserverId};
pub use message_window::{MessagePage, MessageWindow};
pub use outbox::{OfflineOutbox, SendOutcome, SyncReport};
pub use router::{Topic, TopicRouter};
