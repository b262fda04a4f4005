//! Courier message sources
//!
//! The broker client lives outside Courier. Pumps only see the
//! [`MessageSource`] contract: receive a batch, then settle every message
//! by acknowledging, abandoning or dead-lettering it.

use async_trait::async_trait;
use bytes::Bytes;
use courier_common::MessageContext;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

pub mod memory;

pub use memory::{DeadLetteredMessage, InMemoryMessageSource};

/// A message handed out by a source, waiting to be settled
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub body: Bytes,
    pub context: MessageContext,
    /// Source-specific handle used to settle this delivery
    pub receipt_handle: String,
}

impl ReceivedMessage {
    pub fn message_id(&self) -> &str {
        self.context.message_id()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Transient receive failure, the caller may retry
    #[error("Receive failed: {0}")]
    Receive(String),

    /// The source lost its connection and cannot serve further receives
    #[error("Source disconnected: {0}")]
    Disconnected(String),

    #[error("Failed to settle message {message_id}: {reason}")]
    Settle { message_id: String, reason: String },

    #[error("Unknown receipt handle: {0}")]
    UnknownReceipt(String),
}

impl QueueError {
    /// Whether the receive loop must give up on this source
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::Disconnected(_))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Broker-facing collaborator consumed by a message pump
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Identifier used in logs
    fn identifier(&self) -> &str;

    /// Receive up to `max_count` messages.
    ///
    /// Implementations may wait for messages but must return promptly
    /// (possibly with an empty batch) once `cancel` fires.
    async fn receive_batch(
        &self,
        max_count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Complete the message, it will not be delivered again
    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<()>;

    /// Release the message for redelivery, annotating it with `properties`
    async fn abandon(
        &self,
        message: &ReceivedMessage,
        properties: HashMap<String, serde_json::Value>,
    ) -> Result<()>;

    /// Move the message to the dead-letter queue
    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<()>;

    /// Re-establish the broker connection, e.g. after a credential rotation
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }
}
