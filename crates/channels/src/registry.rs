use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tracing::debug;

#[cfg(feature = "metrics")]
use switchyard_metrics::{channel as ch_metrics, gauge};

use crate::channel::{Channel, ChannelStats};

/// Registry of named channels. Names are matched case-insensitively; the
/// spelling used at creation is kept as the channel's display name.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Return the channel called `name`, creating it on first use.
    pub fn find_or_create(&self, name: &str) -> Arc<Channel> {
        if let Some(channel) = self.get(name) {
            return channel;
        }
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        let channel = channels
            .entry(key(name))
            .or_insert_with(|| {
                debug!(channel = %name, "channel created");
                Arc::new(Channel::new(name.trim()))
            })
            .clone();
        #[cfg(feature = "metrics")]
        gauge!(ch_metrics::ACTIVE).set(channels.len() as f64);
        channel
    }

    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key(name))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove a channel, closing it so blocked receivers return.
    pub fn remove(&self, name: &str) -> Option<Arc<Channel>> {
        let removed = self
            .channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key(name));
        if let Some(channel) = &removed {
            channel.close();
        }
        removed
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|channel| channel.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> Vec<(String, ChannelStats)> {
        let mut stats: Vec<(String, ChannelStats)> = self
            .channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|channel| (channel.name().to_string(), channel.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Close every channel.
    pub fn close_all(&self) {
        for channel in self
            .channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            channel.close();
        }
    }
}
