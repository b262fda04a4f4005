//! In-memory message source
//!
//! FIFO queue with receipt handles and a dead-letter list. Used by the
//! development binary and as a test double for pumps.

use async_trait::async_trait;
use bytes::Bytes;
use courier_common::MessageContext;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{MessageSource, QueueError, ReceivedMessage, Result};

const DEFAULT_LONG_POLL: Duration = Duration::from_millis(250);

/// A message moved to the dead-letter list
#[derive(Debug, Clone)]
pub struct DeadLetteredMessage {
    pub body: Bytes,
    pub context: MessageContext,
    pub reason: String,
    pub description: String,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Bytes,
    context: MessageContext,
}

pub struct InMemoryMessageSource {
    identifier: String,
    /// Maximum time a receive waits for the first message
    long_poll: Duration,
    pending: Mutex<VecDeque<StoredMessage>>,
    /// Delivered but not yet settled, by receipt handle
    in_flight: DashMap<String, StoredMessage>,
    completed: Mutex<Vec<String>>,
    dead_letters: Mutex<Vec<DeadLetteredMessage>>,
    notify: Notify,
    disconnected: AtomicBool,
    receipt_counter: AtomicU64,
    receive_calls: AtomicU64,
    reconnects: AtomicU32,
}

impl InMemoryMessageSource {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self::with_long_poll(identifier, DEFAULT_LONG_POLL)
    }

    pub fn with_long_poll(identifier: impl Into<String>, long_poll: Duration) -> Self {
        Self {
            identifier: identifier.into(),
            long_poll,
            pending: Mutex::new(VecDeque::new()),
            in_flight: DashMap::new(),
            completed: Mutex::new(Vec::new()),
            dead_letters: Mutex::new(Vec::new()),
            notify: Notify::new(),
            disconnected: AtomicBool::new(false),
            receipt_counter: AtomicU64::new(0),
            receive_calls: AtomicU64::new(0),
            reconnects: AtomicU32::new(0),
        }
    }

    /// Enqueue a message at the back of the queue
    pub fn push(&self, body: impl Into<Bytes>, context: MessageContext) {
        self.pending.lock().push_back(StoredMessage {
            body: body.into(),
            context,
        });
        self.notify.notify_one();
    }

    /// Simulate a lost broker connection; receives fail until `reconnect`
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Message ids acknowledged so far, in completion order
    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().clone()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetteredMessage> {
        self.dead_letters.lock().clone()
    }

    /// Number of `receive_batch` calls made against this source
    pub fn receive_calls(&self) -> u64 {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn take_batch(&self, max_count: usize) -> Vec<ReceivedMessage> {
        let mut pending = self.pending.lock();
        let take = max_count.min(pending.len());

        pending
            .drain(..take)
            .map(|stored| {
                let receipt = format!(
                    "{}-{}",
                    self.identifier,
                    self.receipt_counter.fetch_add(1, Ordering::SeqCst)
                );
                self.in_flight.insert(receipt.clone(), stored.clone());
                ReceivedMessage {
                    body: stored.body,
                    context: stored.context,
                    receipt_handle: receipt,
                }
            })
            .collect()
    }

    fn settle(&self, message: &ReceivedMessage) -> Result<StoredMessage> {
        self.in_flight
            .remove(&message.receipt_handle)
            .map(|(_, stored)| stored)
            .ok_or_else(|| QueueError::UnknownReceipt(message.receipt_handle.clone()))
    }

    fn check_connected(&self) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(QueueError::Disconnected(format!("{} is disconnected", self.identifier)));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSource for InMemoryMessageSource {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn receive_batch(
        &self,
        max_count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + self.long_poll;

        loop {
            self.check_connected()?;
            if cancel.is_cancelled() {
                return Ok(Vec::new());
            }

            let batch = self.take_batch(max_count);
            if !batch.is_empty() {
                debug!(source = %self.identifier, count = batch.len(), "Delivered batch");
                return Ok(batch);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Vec::new()),
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<()> {
        let stored = self.settle(message)?;
        self.completed.lock().push(stored.context.message_id().to_string());
        Ok(())
    }

    async fn abandon(
        &self,
        message: &ReceivedMessage,
        properties: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let stored = self.settle(message)?;
        let delivery_count = stored.context.delivery_count() + 1;
        let context = stored
            .context
            .with_properties(properties)
            .with_delivery_count(delivery_count);

        self.pending.lock().push_back(StoredMessage {
            body: stored.body,
            context,
        });
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<()> {
        let stored = self.settle(message)?;
        self.dead_letters.lock().push(DeadLetteredMessage {
            body: stored.body,
            context: stored.context,
            reason: reason.to_string(),
            description: description.to_string(),
        });
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        self.disconnected.store(false, Ordering::SeqCst);
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        info!(source = %self.identifier, "In-memory source reconnected");
        Ok(())
    }
}
