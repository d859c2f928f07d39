use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    serde::Serialize,
    switchyard_common::{Envelope, Error, Result},
    tokio::sync::{Notify, broadcast},
    tracing::{debug, trace},
};

#[cfg(feature = "metrics")]
use switchyard_metrics::{channel as ch_metrics, counter, gauge, labels};

const EVENT_CAPACITY: usize = 1024;

/// Whether an envelope entered or left a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelEventKind {
    Sent,
    Received,
}

/// Notification broadcast to channel subscribers.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub kind: ChannelEventKind,
    pub channel: String,
    pub envelope: Envelope,
    /// Identity of the consumer that dequeued the envelope, for `Received`.
    pub consumer: Option<String>,
}

/// Point-in-time counters for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ChannelStats {
    pub sent: u64,
    pub received: u64,
    pub depth: usize,
}

/// Named FIFO of envelopes, safe to share between tasks.
pub struct Channel {
    name: String,
    queue: Mutex<VecDeque<Envelope>>,
    available: Notify,
    events: broadcast::Sender<ChannelEvent>,
    sent: AtomicU64,
    received: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            events,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue an envelope and broadcast a `Sent` event.
    ///
    /// Stamps the header's input channel when the sender left it empty.
    pub fn send(&self, mut envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(Error::channel(&self.name, "channel is closed"));
        }
        if envelope.header.input_channel.is_none() {
            envelope.header.input_channel = Some(self.name.clone());
        }
        let event = (self.events.receiver_count() > 0).then(|| envelope.clone());
        let depth = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(envelope);
            queue.len()
        };
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();
        trace!(channel = %self.name, depth, "envelope sent");

        #[cfg(feature = "metrics")]
        {
            counter!(ch_metrics::MESSAGES_SENT_TOTAL, labels::CHANNEL => self.name.clone())
                .increment(1);
            gauge!(ch_metrics::DEPTH, labels::CHANNEL => self.name.clone()).set(depth as f64);
        }

        if let Some(envelope) = event {
            // No subscribers left is not an error.
            let _ = self.events.send(ChannelEvent {
                kind: ChannelEventKind::Sent,
                channel: self.name.clone(),
                envelope,
                consumer: None,
            });
        }
        Ok(())
    }

    /// Dequeue without waiting.
    pub fn try_receive(&self) -> Option<Envelope> {
        self.try_receive_as(None)
    }

    /// Dequeue without waiting, recording `consumer` on the `Received` event.
    pub fn try_receive_as(&self, consumer: Option<&str>) -> Option<Envelope> {
        let (envelope, depth) = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            let envelope = queue.pop_front()?;
            (envelope, queue.len())
        };
        self.received.fetch_add(1, Ordering::Relaxed);
        trace!(channel = %self.name, depth, "envelope received");

        #[cfg(feature = "metrics")]
        {
            counter!(ch_metrics::MESSAGES_RECEIVED_TOTAL, labels::CHANNEL => self.name.clone())
                .increment(1);
            gauge!(ch_metrics::DEPTH, labels::CHANNEL => self.name.clone()).set(depth as f64);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = depth;

        if self.events.receiver_count() > 0 {
            let _ = self.events.send(ChannelEvent {
                kind: ChannelEventKind::Received,
                channel: self.name.clone(),
                envelope: envelope.clone(),
                consumer: consumer.map(str::to_string),
            });
        }
        Some(envelope)
    }

    /// Wait for the next envelope. Returns `None` once the channel is closed
    /// and empty.
    pub async fn receive(&self) -> Option<Envelope> {
        self.receive_as(None).await
    }

    pub async fn receive_as(&self, consumer: Option<&str>) -> Option<Envelope> {
        loop {
            let notified = self.available.notified();
            if let Some(envelope) = self.try_receive_as(consumer) {
                return Some(envelope);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Like [`Channel::receive`] but gives up after `timeout`.
    pub async fn receive_timeout(&self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.receive()).await.ok().flatten()
    }

    /// Subscribe to `Sent` / `Received` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Remove and return everything currently queued, in order.
    pub fn drain(&self) -> Vec<Envelope> {
        let mut drained = Vec::new();
        while let Some(envelope) = self.try_receive() {
            drained.push(envelope);
        }
        drained
    }

    /// Copy of the queued envelopes without dequeuing them.
    pub fn snapshot(&self) -> Vec<Envelope> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            depth: self.len(),
        }
    }

    /// Refuse further sends and wake every waiting receiver. Queued envelopes
    /// stay receivable.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(channel = %self.name, "channel closed");
        }
        self.available.notify_waiters();
    }

    /// Accept sends again after [`Channel::close`].
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, std::sync::Arc};

    #[test]
    fn fifo_order() {
        let channel = Channel::new("orders");
        for n in 0..3u32 {
            channel.send(Envelope::new(n)).unwrap();
        }
        let got: Vec<u32> = channel
            .drain()
            .iter()
            .map(|e| *e.payload::<u32>().unwrap())
            .collect();
        assert_eq!(got, vec![0, 1, 2]);
        assert!(channel.is_empty());
    }

    #[test]
    fn send_stamps_input_channel() {
        let channel = Channel::new("orders");
        channel.send(Envelope::new(1u8)).unwrap();
        let mut preset = Envelope::new(2u8);
        preset.header.input_channel = Some("elsewhere".into());
        channel.send(preset).unwrap();
        let drained = channel.drain();
        assert_eq!(drained[0].header.input_channel.as_deref(), Some("orders"));
        assert_eq!(drained[1].header.input_channel.as_deref(), Some("elsewhere"));
    }

    #[test]
    fn stats_track_traffic() {
        let channel = Channel::new("orders");
        channel.send(Envelope::new(1u8)).unwrap();
        channel.send(Envelope::new(2u8)).unwrap();
        channel.try_receive().unwrap();
        assert_eq!(channel.stats(), ChannelStats {
            sent: 2,
            received: 1,
            depth: 1,
        });
    }

    #[tokio::test]
    async fn events_carry_consumer() {
        let channel = Channel::new("orders");
        let mut events = channel.subscribe();
        channel.send(Envelope::new("a".to_string())).unwrap();
        channel.try_receive_as(Some("worker-1")).unwrap();

        let sent = events.recv().await.unwrap();
        assert_eq!(sent.kind, ChannelEventKind::Sent);
        assert!(sent.consumer.is_none());
        let received = events.recv().await.unwrap();
        assert_eq!(received.kind, ChannelEventKind::Received);
        assert_eq!(received.consumer.as_deref(), Some("worker-1"));
        assert_eq!(received.envelope.payload::<String>().unwrap(), "a");
    }

    #[tokio::test]
    async fn receive_waits_for_send() {
        let channel = Arc::new(Channel::new("orders"));
        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.receive().await })
        };
        tokio::task::yield_now().await;
        channel.send(Envelope::new(9u32)).unwrap();
        let envelope = waiter.await.unwrap().unwrap();
        assert_eq!(envelope.payload::<u32>(), Some(&9));
    }

    #[tokio::test]
    async fn close_wakes_receivers_and_rejects_sends() {
        let channel = Arc::new(Channel::new("orders"));
        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.receive().await })
        };
        tokio::task::yield_now().await;
        channel.close();
        assert!(waiter.await.unwrap().is_none());
        assert!(channel.send(Envelope::empty()).is_err());
        channel.reopen();
        assert!(channel.send(Envelope::empty()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn receive_timeout_expires() {
        let channel = Channel::new("orders");
        assert!(
            channel
                .receive_timeout(Duration::from_millis(50))
                .await
                .is_none()
        );
    }
}
