use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Serialize;
use shared::{
    domain::{ConversationId, MessageId},
    error::{ApiError, ErrorCode},
    protocol::{ConversationSummary, Message, SendMessageRequest},
};
use tokio::sync::RwLock;

/// Which side of the loaded history to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCursor {
    Latest,
    /// Messages with an id strictly lower than this one.
    Before(MessageId),
    /// Messages with an id strictly greater than this one.
    After(MessageId),
}

/// The REST calls the sync core depends on.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        request: &SendMessageRequest,
    ) -> Result<Message>;
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        cursor: MessageCursor,
        limit: u32,
    ) -> Result<Vec<Message>>;
    async fn refresh_conversation_list(&self) -> Result<Vec<ConversationSummary>>;
}

pub struct MissingChatApi;

#[async_trait]
impl ChatApi for MissingChatApi {
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        _request: &SendMessageRequest,
    ) -> Result<Message> {
        Err(anyhow!(
            "chat api unavailable: cannot send to conversation {}",
            conversation_id.0
        ))
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        _cursor: MessageCursor,
        _limit: u32,
    ) -> Result<Vec<Message>> {
        Err(anyhow!(
            "chat api unavailable: cannot fetch conversation {}",
            conversation_id.0
        ))
    }

    async fn refresh_conversation_list(&self) -> Result<Vec<ConversationSummary>> {
        Err(anyhow!("chat api unavailable: cannot list conversations"))
    }
}

/// Server rejected the request because it already holds a message with this client id.
pub fn is_duplicate_delivery(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>()
        .is_some_and(|api| api.code == ErrorCode::Conflict)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesQuery {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    after_id: Option<i64>,
}

impl ListMessagesQuery {
    fn new(cursor: MessageCursor, limit: u32) -> Self {
        let (before_id, after_id) = match cursor {
            MessageCursor::Latest => (None, None),
            MessageCursor::Before(id) => (Some(id.0), None),
            MessageCursor::After(id) => (None, Some(id.0)),
        };
        Self {
            limit,
            before_id,
            after_id,
        }
    }
}

pub struct HttpChatApi {
    http: Client,
    server_url: String,
    access_token: RwLock<String>,
}

impl HttpChatApi {
    pub fn new(server_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            access_token: RwLock::new(access_token.into()),
        }
    }

    pub async fn set_access_token(&self, access_token: impl Into<String>) {
        *self.access_token.write().await = access_token.into();
    }

    async fn token(&self) -> String {
        self.access_token.read().await.clone()
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => {
            Err(anyhow::Error::new(api_error).context(format!("request failed with status {status}")))
        }
        Err(_) => Err(anyhow!("request failed with status {status}: {body}")),
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        request: &SendMessageRequest,
    ) -> Result<Message> {
        let response = self
            .http
            .post(format!(
                "{}/conversations/{}/messages",
                self.server_url, conversation_id.0
            ))
            .bearer_auth(self.token().await)
            .json(request)
            .send()
            .await
            .with_context(|| format!("failed to send message to conversation {}", conversation_id.0))?;
        let message = check_status(response).await?.json().await?;
        Ok(message)
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        cursor: MessageCursor,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let response = self
            .http
            .get(format!(
                "{}/conversations/{}/messages",
                self.server_url, conversation_id.0
            ))
            .bearer_auth(self.token().await)
            .query(&ListMessagesQuery::new(cursor, limit.clamp(1, 100)))
            .send()
            .await
            .with_context(|| {
                format!(
                    "failed to fetch messages for conversation {}",
                    conversation_id.0
                )
            })?;
        let messages = check_status(response).await?.json().await?;
        Ok(messages)
    }

    async fn refresh_conversation_list(&self) -> Result<Vec<ConversationSummary>> {
        let response = self
            .http
            .get(format!("{}/conversations", self.server_url))
            .bearer_auth(self.token().await)
            .send()
            .await
            .context("failed to list conversations")?;
        let conversations = check_status(response).await?.json().await?;
        Ok(conversations)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
