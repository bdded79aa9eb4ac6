//! Scrollable history for one conversation, merged with live pushes.
//!
//! Pages are kept newest first and every message inside a page is newest
//! first, so iterating the pages in order walks the history backwards.
//! Scrolling back only ever fetches older pages; newer pages are fetched only
//! after [`MessageWindow::jump_to`] has moved the window away from the live
//! edge.

use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result};
use shared::{
    domain::{ConversationId, MessageId},
    protocol::{Message, ReactionAction, ReactionEntry, TopicPayload},
};
use tracing::debug;

use crate::{
    api::{ChatApi, MessageCursor},
    event_bus::BusEvent,
};

pub const DEFAULT_PAGE_SIZE: u32 = 30;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Lowest id on the page; the cursor for the next older fetch.
    pub before_id: Option<MessageId>,
    /// Highest id on the page; the cursor for the next newer fetch.
    pub after_id: Option<MessageId>,
}

impl MessagePage {
    fn new(mut messages: Vec<Message>) -> Self {
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        let mut page = Self {
            messages,
            ..Self::default()
        };
        page.refresh_cursors();
        page
    }

    fn refresh_cursors(&mut self) {
        self.after_id = self.messages.first().map(|message| message.id);
        self.before_id = self.messages.last().map(|message| message.id);
    }
}

pub struct MessageWindow {
    conversation_id: ConversationId,
    fetcher: Arc<dyn ChatApi>,
    page_size: u32,
    pages: Vec<MessagePage>,
    loaded: HashSet<MessageId>,
    has_more_older: bool,
    has_more_newer: bool,
    jumping: bool,
}

impl MessageWindow {
    pub fn new(conversation_id: ConversationId, fetcher: Arc<dyn ChatApi>, page_size: u32) -> Self {
        Self {
            conversation_id,
            fetcher,
            page_size: page_size.max(1),
            pages: Vec::new(),
            loaded: HashSet::new(),
            has_more_older: true,
            has_more_newer: false,
            jumping: false,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn pages(&self) -> &[MessagePage] {
        &self.pages
    }

    /// Every loaded message, newest first.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.pages.iter().flat_map(|page| page.messages.iter())
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.loaded.contains(&id)
    }

    pub fn has_more_older(&self) -> bool {
        self.has_more_older
    }

    pub fn has_more_newer(&self) -> bool {
        self.has_more_newer
    }

    pub fn is_jumping(&self) -> bool {
        self.jumping
    }

    fn reset(&mut self) {
        self.pages.clear();
        self.loaded.clear();
        self.has_more_older = true;
        self.has_more_newer = false;
        self.jumping = false;
    }

    async fn fetch(&self, cursor: MessageCursor) -> Result<Vec<Message>> {
        debug!(
            conversation_id = self.conversation_id.0,
            ?cursor,
            limit = self.page_size,
            "window: fetching page"
        );
        self.fetcher
            .fetch_messages(self.conversation_id, cursor, self.page_size)
            .await
            .with_context(|| {
                format!(
                    "failed to load messages for conversation {}",
                    self.conversation_id.0
                )
            })
    }

    /// Page of fetched messages that are not already loaded, plus whether the
    /// server returned a full page.
    fn admit(&mut self, fetched: Vec<Message>) -> (MessagePage, bool) {
        let full = fetched.len() >= self.page_size as usize;
        let fresh: Vec<Message> = fetched
            .into_iter()
            .filter(|message| self.loaded.insert(message.id))
            .collect();
        (MessagePage::new(fresh), full)
    }

    pub async fn load_latest(&mut self) -> Result<()> {
        let fetched = self.fetch(MessageCursor::Latest).await?;
        self.reset();
        let (page, full) = self.admit(fetched);
        self.has_more_older = full;
        if !page.messages.is_empty() {
            self.pages.push(page);
        }
        Ok(())
    }

    /// Loads the page before the oldest loaded message. Returns `false`,
    /// without fetching, once the start of the conversation was reached.
    pub async fn fetch_older(&mut self) -> Result<bool> {
        if !self.has_more_older {
            return Ok(false);
        }
        let Some(oldest) = self.loaded.iter().min().copied() else {
            self.load_latest().await?;
            return Ok(true);
        };

        let fetched = self.fetch(MessageCursor::Before(oldest)).await?;
        let (page, full) = self.admit(fetched);
        self.has_more_older = full;
        if !full {
            debug!(
                conversation_id = self.conversation_id.0,
                "window: reached oldest message"
            );
        }
        if !page.messages.is_empty() {
            self.pages.push(page);
        }
        Ok(true)
    }

    /// Replaces the window with the page ending at `target` and enables
    /// forward fetching until the live edge is reached again.
    pub async fn jump_to(&mut self, target: MessageId) -> Result<()> {
        let fetched = self
            .fetch(MessageCursor::Before(MessageId(target.0.saturating_add(1))))
            .await?;
        self.reset();
        self.jumping = true;
        self.has_more_newer = true;
        let (page, full) = self.admit(fetched);
        self.has_more_older = full;
        if !page.messages.is_empty() {
            self.pages.push(page);
        }
        Ok(())
    }

    /// Loads the page after the newest loaded message. Only active after a
    /// jump; a short page means the live edge was reached and ends the jump.
    pub async fn fetch_newer(&mut self) -> Result<bool> {
        if !self.jumping || !self.has_more_newer {
            return Ok(false);
        }
        let Some(newest) = self.loaded.iter().max().copied() else {
            self.load_latest().await?;
            return Ok(true);
        };

        let fetched = self.fetch(MessageCursor::After(newest)).await?;
        let (page, full) = self.admit(fetched);
        if !full {
            debug!(
                conversation_id = self.conversation_id.0,
                "window: back at live edge"
            );
            self.has_more_newer = false;
            self.jumping = false;
        }
        if !page.messages.is_empty() {
            self.pages.insert(0, page);
        }
        Ok(true)
    }

    /// Folds a bus event into the window. Returns whether anything changed.
    pub fn apply_event(&mut self, event: &BusEvent) -> bool {
        let payload = match event {
            BusEvent::OutboxMessageDelivered { message, .. } => return self.insert_live(message),
            BusEvent::Topic(payload) => payload,
            _ => return false,
        };
        if payload.conversation_id() != Some(self.conversation_id) {
            return false;
        }
        match payload {
            TopicPayload::NewMessage(message) => self.insert_live(message),
            TopicPayload::MessageUnsent(unsent) => match self.find_mut(unsent.message_id) {
                Some(message) if !message.is_unsent => {
                    message.is_unsent = true;
                    true
                }
                _ => false,
            },
            TopicPayload::MessageReaction(reaction) => {
                let Some(message) = self.find_mut(reaction.message_id) else {
                    return false;
                };
                let entry = ReactionEntry {
                    user_id: reaction.user_id,
                    reaction: reaction.reaction.clone(),
                };
                match reaction.action {
                    ReactionAction::Added if !message.reactions.contains(&entry) => {
                        message.reactions.push(entry);
                        true
                    }
                    ReactionAction::Added => false,
                    ReactionAction::Removed => {
                        let before = message.reactions.len();
                        message.reactions.retain(|existing| *existing != entry);
                        message.reactions.len() != before
                    }
                }
            }
            _ => false,
        }
    }

    fn insert_live(&mut self, message: &Message) -> bool {
        if message.conversation_id != self.conversation_id {
            return false;
        }
        // Mid-jump the newest page is not the live edge; forward fetching will pick it up.
        if self.jumping || self.loaded.contains(&message.id) {
            return false;
        }
        self.loaded.insert(message.id);
        if self.pages.is_empty() {
            self.pages.push(MessagePage::default());
        }
        // Pushes can arrive out of order; keep the page sorted newest first.
        let newest = &mut self.pages[0];
        let index = newest
            .messages
            .iter()
            .position(|existing| existing.id < message.id)
            .unwrap_or(newest.messages.len());
        newest.messages.insert(index, message.clone());
        newest.refresh_cursors();
        debug!(
            conversation_id = self.conversation_id.0,
            message_id = message.id.0,
            "window: merged live message"
        );
        true
    }

    fn find_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        if !self.loaded.contains(&id) {
            return None;
        }
        self.pages
            .iter_mut()
            .flat_map(|page| page.messages.iter_mut())
            .find(|message| message.id == id)
    }
}

#[cfg(test)]
#[path = "tests/message_window_tests.rs"]
mod tests;
