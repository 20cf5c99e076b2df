//! Messaging Gateway contract.
//!
//! The core never talks to a chat transport directly. Outbound traffic goes through the
//! [`Gateway`] trait; inbound user actions arrive as [`GatewayEvent`]s handed to
//! `Controller::handle_event`. Choice tokens are decoded into [`Action`]s by the transport
//! before they reach the core.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::Action;
use crate::project::{ChatId, PrincipalId};
use crate::retry::{with_retry, RetryPolicy};

pub type MessageId = i64;

#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("unknown document: {0}")]
    UnknownDocument(String),
}

/// One selectable option attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub label: String,
    pub token: String,
}

impl Choice {
    pub fn new(label: impl Into<String>, action: &Action) -> Self {
        Self {
            label: label.into(),
            token: action.encode(),
        }
    }
}

/// Opaque reference to an uploaded document held by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef(pub String);

/// Inbound user action.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Document {
        user_id: PrincipalId,
        chat_id: ChatId,
        file_name: String,
        file: FileRef,
    },
    Choice {
        user_id: PrincipalId,
        chat_id: ChatId,
        message_id: MessageId,
        action: Action,
    },
    Text {
        user_id: PrincipalId,
        chat_id: ChatId,
        text: String,
    },
}

impl GatewayEvent {
    pub fn user_id(&self) -> PrincipalId {
        match self {
            GatewayEvent::Document { user_id, .. }
            | GatewayEvent::Choice { user_id, .. }
            | GatewayEvent::Text { user_id, .. } => *user_id,
        }
    }

    pub fn chat_id(&self) -> ChatId {
        match self {
            GatewayEvent::Document { chat_id, .. }
            | GatewayEvent::Choice { chat_id, .. }
            | GatewayEvent::Text { chat_id, .. } => *chat_id,
        }
    }

    /// Whether handling the event twice is harmless. A document is consumed by its first
    /// download, so its handler retries its own steps instead.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, GatewayEvent::Document { .. })
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        choices: &[Choice],
    ) -> Result<MessageId, GatewayError>;

    async fn edit_text(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        choices: &[Choice],
    ) -> Result<(), GatewayError>;

    async fn download_document(&self, file: &FileRef) -> Result<Vec<u8>, GatewayError>;
}

/// Best-effort outbound sends with retry. Delivery failures are logged, never propagated.
#[derive(Clone)]
pub struct Notifier {
    gateway: Arc<dyn Gateway>,
    retry: RetryPolicy,
}

impl Notifier {
    pub fn new(gateway: Arc<dyn Gateway>, retry: RetryPolicy) -> Self {
        Self { gateway, retry }
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub async fn send(&self, chat_id: ChatId, text: &str) -> Option<MessageId> {
        self.send_with_choices(chat_id, text, &[]).await
    }

    pub async fn send_with_choices(
        &self,
        chat_id: ChatId,
        text: &str,
        choices: &[Choice],
    ) -> Option<MessageId> {
        match with_retry(self.retry, "send_message", move || {
            self.gateway.send_text(chat_id, text, choices)
        })
        .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "message dropped");
                None
            }
        }
    }

    pub async fn edit(&self, chat_id: ChatId, message_id: MessageId, text: &str, choices: &[Choice]) {
        if let Err(e) = with_retry(self.retry, "edit_message", move || {
            self.gateway.edit_text(chat_id, message_id, text, choices)
        })
        .await
        {
            tracing::warn!(chat_id, message_id, error = %e, "edit dropped");
        }
    }
}

/// A message as queued by [`MemoryGateway`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub text: String,
    pub choices: Vec<Choice>,
    pub edited: bool,
}

/// In-process gateway: queues outbound messages per chat and holds uploaded documents
/// until the core downloads them. Backs the daemon's HTTP transport and the tests.
#[derive(Default)]
pub struct MemoryGateway {
    next_message_id: AtomicI64,
    next_document_id: AtomicI64,
    outbox: Mutex<HashMap<ChatId, Vec<OutboundMessage>>>,
    documents: DashMap<String, Vec<u8>>,
    failures_pending: AtomicU32,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold an uploaded document and return the reference the core will download it by.
    pub fn stash_document(&self, bytes: Vec<u8>) -> FileRef {
        let id = self.next_document_id.fetch_add(1, Ordering::Relaxed) + 1;
        let key = format!("doc-{}", id);
        self.documents.insert(key.clone(), bytes);
        FileRef(key)
    }

    /// Remove and return every message queued for `chat_id`.
    pub fn drain(&self, chat_id: ChatId) -> Vec<OutboundMessage> {
        self.outbox
            .lock()
            .map(|mut o| o.remove(&chat_id).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Snapshot of messages queued for `chat_id`, oldest first.
    pub fn messages(&self, chat_id: ChatId) -> Vec<OutboundMessage> {
        self.outbox
            .lock()
            .map(|o| o.get(&chat_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn texts(&self, chat_id: ChatId) -> Vec<String> {
        self.messages(chat_id).into_iter().map(|m| m.text).collect()
    }

    pub fn last(&self, chat_id: ChatId) -> Option<OutboundMessage> {
        self.messages(chat_id).pop()
    }

    /// Make the next `n` sends fail with a delivery error.
    pub fn fail_next_sends(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        choices: &[Choice],
    ) -> Result<MessageId, GatewayError> {
        if self.take_failure() {
            return Err(GatewayError::Delivery("injected failure".to_string()));
        }
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1;
        let msg = OutboundMessage {
            message_id,
            chat_id,
            text: text.to_string(),
            choices: choices.to_vec(),
            edited: false,
        };
        self.outbox
            .lock()
            .map_err(|e| GatewayError::Delivery(e.to_string()))?
            .entry(chat_id)
            .or_default()
            .push(msg);
        Ok(message_id)
    }

    async fn edit_text(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        choices: &[Choice],
    ) -> Result<(), GatewayError> {
        if self.take_failure() {
            return Err(GatewayError::Delivery("injected failure".to_string()));
        }
        // Edits are queued as new entries so a polling client sees every state change.
        let msg = OutboundMessage {
            message_id,
            chat_id,
            text: text.to_string(),
            choices: choices.to_vec(),
            edited: true,
        };
        self.outbox
            .lock()
            .map_err(|e| GatewayError::Delivery(e.to_string()))?
            .entry(chat_id)
            .or_default()
            .push(msg);
        Ok(())
    }

    async fn download_document(&self, file: &FileRef) -> Result<Vec<u8>, GatewayError> {
        self.documents
            .remove(&file.0)
            .map(|(_, bytes)| bytes)
            .ok_or_else(|| GatewayError::UnknownDocument(file.0.clone()))
    }
}
