//! In-process queues addressed as `memory://<queue>`.
//!
//! Useful for tests and for wiring two halves of a process together without
//! touching disk.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use {
    async_trait::async_trait,
    switchyard_common::{Envelope, PayloadCodec, Result},
    tracing::debug,
};

use crate::transport::{MessageSink, MessageSource, RawMessage, envelope_bytes};

/// Named FIFO queues of raw messages shared by memory sources and sinks.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<RawMessage>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn push(&self, queue: &str, message: RawMessage) {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
    }

    pub fn pop(&self, queue: &str) -> Option<RawMessage> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(queue)
            .and_then(VecDeque::pop_front)
    }

    /// Copy of a queue's contents without consuming them.
    pub fn peek_all(&self, queue: &str) -> Vec<RawMessage> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return a queue's contents.
    pub fn take_all(&self, queue: &str) -> Vec<RawMessage> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(queue)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }
}

/// `memory-in`: pops the next message of one queue.
pub struct MemorySource {
    broker: Arc<MemoryBroker>,
    queue: String,
}

impl MemorySource {
    pub fn new(broker: Arc<MemoryBroker>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    fn describe(&self) -> String {
        format!("memory://{}", self.queue)
    }

    async fn receive(&self) -> Result<Option<RawMessage>> {
        Ok(self.broker.pop(&self.queue))
    }
}

/// `memory-out`: appends envelopes to one queue as raw messages.
pub struct MemorySink {
    broker: Arc<MemoryBroker>,
    queue: String,
    codec: Arc<dyn PayloadCodec>,
}

impl MemorySink {
    pub fn new(
        broker: Arc<MemoryBroker>,
        queue: impl Into<String>,
        codec: Arc<dyn PayloadCodec>,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            codec,
        }
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    fn describe(&self) -> String {
        format!("memory://{}", self.queue)
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<()> {
        let bytes = envelope_bytes(envelope, self.codec.as_ref())?;
        self.broker.push(&self.queue, RawMessage {
            bytes,
            header: envelope.header.clone(),
            receipt: None,
        });
        debug!(queue = %self.queue, message_id = envelope.header.message_id(), "envelope queued in memory");
        Ok(())
    }
}
