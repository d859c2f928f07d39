//! Forwarding sink addressed as `channel://<name>`.

use std::sync::Arc;

use {
    async_trait::async_trait,
    switchyard_channels::ChannelRegistry,
    switchyard_common::{Envelope, Result},
};

use crate::transport::MessageSink;

/// `channel-out`: re-publishes envelopes on another bus channel.
pub struct ChannelSink {
    channels: Arc<ChannelRegistry>,
    channel: String,
}

impl ChannelSink {
    pub fn new(channels: Arc<ChannelRegistry>, channel: impl Into<String>) -> Self {
        Self {
            channels,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    fn describe(&self) -> String {
        format!("channel://{}", self.channel)
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<()> {
        let mut forwarded = envelope.clone();
        forwarded.header.input_channel = None;
        self.channels.find_or_create(&self.channel).send(forwarded)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_into_named_channel() {
        let channels = ChannelRegistry::shared();
        let sink = ChannelSink::new(Arc::clone(&channels), "Dead");
        sink.deliver(&Envelope::new(1u8)).await.unwrap();
        let dead = channels.get("dead").unwrap();
        let forwarded = dead.try_receive().unwrap();
        assert_eq!(forwarded.header.input_channel.as_deref(), Some("Dead"));
    }
}
