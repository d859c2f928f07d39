//! Logical unit of work framing a publish.
//!
//! Envelopes staged on a [`UnitOfWork`] reach their channels only on
//! [`UnitOfWork::commit`]. Dropping an uncommitted unit discards them.

use std::sync::Arc;

use {
    switchyard_channels::Channel,
    switchyard_common::{Envelope, Result},
    tracing::{debug, trace},
    uuid::Uuid,
};

pub struct UnitOfWork {
    id: Uuid,
    owner: String,
    staged: Vec<(Arc<Channel>, Envelope)>,
    finished: bool,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("staged", &self.staged.len())
            .finish()
    }
}

impl UnitOfWork {
    pub fn begin(owner: impl Into<String>) -> Self {
        let unit = Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            staged: Vec::new(),
            finished: false,
        };
        trace!(unit = %unit.id, owner = %unit.owner, "unit of work begun");
        unit
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn stage(&mut self, channel: Arc<Channel>, envelope: Envelope) {
        self.staged.push((channel, envelope));
    }

    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    /// Publish every staged envelope in order. Returns how many were sent.
    pub fn commit(mut self) -> Result<usize> {
        self.finished = true;
        let staged = std::mem::take(&mut self.staged);
        let count = staged.len();
        for (channel, envelope) in staged {
            channel.send(envelope)?;
        }
        trace!(unit = %self.id, owner = %self.owner, count, "unit of work committed");
        Ok(count)
    }

    pub fn rollback(mut self) {
        self.finished = true;
        debug!(unit = %self.id, owner = %self.owner, discarded = self.staged.len(), "unit of work rolled back");
        self.staged.clear();
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if !self.finished && !self.staged.is_empty() {
            debug!(
                unit = %self.id,
                owner = %self.owner,
                discarded = self.staged.len(),
                "unit of work dropped without commit"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn commit_publishes() {
        let channel = Arc::new(Channel::new("orders"));
        let mut unit = UnitOfWork::begin("test");
        unit.stage(Arc::clone(&channel), Envelope::new(1u8));
        unit.stage(Arc::clone(&channel), Envelope::new(2u8));
        assert!(channel.is_empty());
        assert_eq!(unit.commit().unwrap(), 2);
        assert_eq!(channel.len(), 2);
    }

    #[test]
    fn drop_and_rollback_discard() {
        let channel = Arc::new(Channel::new("orders"));
        {
            let mut unit = UnitOfWork::begin("test");
            unit.stage(Arc::clone(&channel), Envelope::new(1u8));
        }
        let mut unit = UnitOfWork::begin("test");
        unit.stage(Arc::clone(&channel), Envelope::new(2u8));
        unit.rollback();
        assert!(channel.is_empty());
    }

    #[test]
    fn commit_to_closed_channel_fails() {
        let channel = Arc::new(Channel::new("orders"));
        channel.close();
        let mut unit = UnitOfWork::begin("test");
        unit.stage(channel, Envelope::empty());
        assert!(unit.commit().is_err());
    }
}
