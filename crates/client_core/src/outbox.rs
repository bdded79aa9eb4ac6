//! Durable queue for messages written while the server is unreachable.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use shared::{
    domain::{ConversationId, MessageId, PendingMessage, PendingStatus},
    protocol::{Message, SendMessageRequest},
};
use storage::PendingMessageStore;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    api::{is_duplicate_delivery, ChatApi},
    connection::ConnectionSnapshot,
    event_bus::{BusEvent, EventBus},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub attempted: usize,
    pub sent: usize,
    pub failed: usize,
    /// Another pass was already running; nothing was read or sent.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(Message),
    Queued(PendingMessage),
}

pub struct OfflineOutbox {
    store: Arc<dyn PendingMessageStore>,
    api: Arc<dyn ChatApi>,
    bus: EventBus,
    syncing: AtomicBool,
}

struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn send_request(pending: &PendingMessage) -> SendMessageRequest {
    SendMessageRequest {
        message_text: pending.message_text.clone(),
        parent_message_id: pending.parent_message_id,
        client_message_id: pending.id.clone(),
    }
}

impl OfflineOutbox {
    pub fn new(
        store: Arc<dyn PendingMessageStore>,
        api: Arc<dyn ChatApi>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            api,
            bus,
            syncing: AtomicBool::new(false),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub async fn pending(&self) -> Result<Vec<PendingMessage>> {
        self.store.list_pending_messages().await
    }

    pub async fn enqueue(
        &self,
        conversation_id: ConversationId,
        message_text: impl Into<String>,
        parent_message_id: Option<MessageId>,
    ) -> Result<PendingMessage> {
        let pending = PendingMessage::new(conversation_id, message_text, parent_message_id);
        self.persist(pending).await
    }

    async fn persist(&self, pending: PendingMessage) -> Result<PendingMessage> {
        self.store
            .insert_pending_message(&pending)
            .await
            .with_context(|| format!("failed to queue message {}", pending.id))?;
        debug!(
            client_id = %pending.id,
            conversation_id = pending.conversation_id.0,
            status = pending.status.as_str(),
            "outbox: queued"
        );
        self.bus.emit(BusEvent::OutboxMessageQueued(pending.clone()));
        Ok(pending)
    }

    /// Sends right away when `online`; otherwise, or when the send fails, the
    /// message lands in the queue for the next sync.
    pub async fn send_or_enqueue(
        &self,
        conversation_id: ConversationId,
        message_text: impl Into<String>,
        parent_message_id: Option<MessageId>,
        online: bool,
    ) -> Result<SendOutcome> {
        let mut pending = PendingMessage::new(conversation_id, message_text, parent_message_id);
        if !online {
            return self.persist(pending).await.map(SendOutcome::Queued);
        }

        match self
            .api
            .send_message(conversation_id, &send_request(&pending))
            .await
        {
            Ok(message) => {
                self.bus.emit(BusEvent::OutboxMessageDelivered {
                    client_id: pending.id,
                    message: message.clone(),
                });
                Ok(SendOutcome::Sent(message))
            }
            Err(err) => {
                warn!(client_id = %pending.id, error = %err, "outbox: send failed, queueing");
                pending.status = PendingStatus::Failed;
                self.persist(pending).await.map(SendOutcome::Queued)
            }
        }
    }

    /// Replays the queue in enqueue order. Per-message failures stay queued
    /// and are reported, never returned.
    pub async fn sync(&self) -> Result<SyncReport> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("outbox: sync already running");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        }
        let _guard = SyncGuard(&self.syncing);

        let queued = self
            .store
            .list_pending_messages()
            .await
            .context("failed to read queued messages")?;
        let mut report = SyncReport {
            attempted: queued.len(),
            ..SyncReport::default()
        };
        if queued.is_empty() {
            return Ok(report);
        }
        info!(count = queued.len(), "outbox: sync started");

        for pending in queued {
            let delivered = match self
                .api
                .send_message(pending.conversation_id, &send_request(&pending))
                .await
            {
                Ok(message) => Some(message),
                Err(err) if is_duplicate_delivery(&err) => {
                    debug!(client_id = %pending.id, "outbox: server already has message");
                    None
                }
                Err(err) => {
                    report.failed += 1;
                    self.record_failure(&pending, &err).await;
                    continue;
                }
            };

            if let Err(err) = self.store.delete_pending_message(&pending.id).await {
                // Left in place; the client id makes the next attempt a no-op on the server.
                warn!(client_id = %pending.id, error = %err, "outbox: failed to remove delivered message");
            }
            report.sent += 1;
            if let Some(message) = delivered {
                self.bus.emit(BusEvent::OutboxMessageDelivered {
                    client_id: pending.id,
                    message,
                });
            }
        }

        self.bus.emit(BusEvent::ConversationListInvalidated);
        match self.api.refresh_conversation_list().await {
            Ok(conversations) => {
                self.bus
                    .emit(BusEvent::ConversationListRefreshed(conversations));
            }
            Err(err) => warn!(error = %err, "outbox: conversation list refresh failed"),
        }

        info!(
            sent = report.sent,
            failed = report.failed,
            "outbox: sync finished"
        );
        Ok(report)
    }

    async fn record_failure(&self, pending: &PendingMessage, err: &anyhow::Error) {
        warn!(
            client_id = %pending.id,
            conversation_id = pending.conversation_id.0,
            error = %err,
            "outbox: send failed, keeping message"
        );
        if let Err(store_err) = self.store.mark_pending_message_failed(&pending.id).await {
            warn!(client_id = %pending.id, error = %store_err, "outbox: failed to mark message");
        }
        self.bus.emit(BusEvent::OutboxMessageFailed {
            client_id: pending.id.clone(),
            error: format!("{err:#}"),
        });
    }

    /// Runs [`OfflineOutbox::sync`] once for every socket that reaches
    /// `Connected`, including right away if one already has. A reconnect that
    /// happens while a sync is running is caught by its new `connected_epoch`.
    pub fn spawn_sync_on_reconnect(
        self: &Arc<Self>,
        mut state: watch::Receiver<ConnectionSnapshot>,
    ) -> JoinHandle<()> {
        let outbox = Arc::clone(self);
        tokio::spawn(async move {
            let mut synced_epoch = None;
            loop {
                let (connected, epoch) = {
                    let snapshot = state.borrow_and_update();
                    (snapshot.is_connected(), snapshot.connected_epoch)
                };
                if connected && synced_epoch != Some(epoch) {
                    synced_epoch = Some(epoch);
                    debug!(epoch, "outbox: syncing after connect");
                    if let Err(err) = outbox.sync().await {
                        warn!(error = %err, "outbox: sync on reconnect failed");
                    }
                }
                if state.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/outbox_tests.rs"]
mod tests;
