//! The adapter trait and the polling loop shared by input and output adapters.

use std::{future::Future, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    switchyard_common::{Error, EventHub, Result},
    tokio::{task::JoinHandle, time::MissedTickBehavior},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error},
    url::Url,
};

/// Which way an adapter moves envelopes across the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// How an adapter's `perform_action` is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polling {
    /// One loop ticking at a fixed interval.
    Scheduled { interval: Duration },
    /// `concurrency` independent loops, each ticking every `frequency`.
    Concurrent {
        concurrency: usize,
        frequency: Duration,
    },
}

impl Default for Polling {
    fn default() -> Self {
        Self::Scheduled {
            interval: Duration::from_secs(1),
        }
    }
}

impl Polling {
    pub fn every(interval: Duration) -> Self {
        Self::Scheduled { interval }
    }

    fn loops(self) -> (usize, Duration) {
        match self {
            Self::Scheduled { interval } => (1, interval),
            Self::Concurrent {
                concurrency,
                frequency,
            } => (concurrency.max(1), frequency),
        }
    }
}

/// Point-in-time view of one adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterStatus {
    pub name: String,
    pub direction: Direction,
    pub uri: String,
    pub channel: Option<String>,
    pub running: bool,
    pub last_error: Option<String>,
}

/// A started/stopped component bridging a channel and a physical location.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn direction(&self) -> Direction;

    fn uri(&self) -> &Url;

    fn channel_name(&self) -> Option<&str>;

    /// The adapter's own notification hub.
    fn events(&self) -> &Arc<EventHub>;

    fn is_running(&self) -> bool;

    fn status(&self) -> AdapterStatus;

    async fn start(&self) -> Result<()>;

    /// Stop polling and release the transport. Returns the error that ended a
    /// worker loop, if one did.
    async fn stop(&self) -> Result<()>;

    /// One poll or drain cycle. `Ok(true)` when an envelope moved.
    async fn perform_action(&self) -> Result<bool>;
}

// ── Worker loops ────────────────────────────────────────────────────────────

/// Running worker loops of one adapter.
pub(crate) struct Workers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl Workers {
    /// Spawn the loops described by `polling`, each calling `action` once per
    /// tick. A loop that gets an error from `action` cancels its siblings and
    /// returns it.
    pub(crate) fn spawn<F, Fut>(adapter: &str, polling: Polling, action: F) -> Self
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (count, period) = polling.loops();
        let period = period.max(Duration::from_millis(1));
        let handles = (0..count)
            .map(|worker| {
                let cancel = cancel.clone();
                let action = action.clone();
                let adapter = adapter.to_string();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => {
                                debug!(adapter = %adapter, worker, "worker loop cancelled");
                                return Ok(());
                            },
                            _ = ticker.tick() => {
                                if let Err(err) = action().await {
                                    error!(adapter = %adapter, worker, error = %err, "worker loop stopped by unhandled error");
                                    cancel.cancel();
                                    return Err(err);
                                }
                            },
                        }
                    }
                })
            })
            .collect();
        Self { cancel, handles }
    }

    /// Cancel every loop and wait for in-flight actions to finish.
    pub(crate) async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        let mut first_error = None;
        for handle in self.handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join) => Err(Error::message(format!("worker task failed: {join}"))),
            };
            if let Err(err) = outcome
                && first_error.is_none()
            {
                first_error = Some(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Wrap a transport error as an adapter error, keeping the kinds the loop
/// treats specially.
pub(crate) fn adapter_error(adapter: &str, err: Error) -> Error {
    match err {
        Error::Cancelled
        | Error::Pipeline { .. }
        | Error::Adapter { .. }
        | Error::NonDelivered { .. }
        | Error::Codec { .. }
        | Error::Json(_) => err,
        other => Error::adapter(adapter, other),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicU32, Ordering},
    };

    #[tokio::test(start_paused = true)]
    async fn concurrent_loops_each_tick() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ticks);
        let workers = Workers::spawn(
            "test",
            Polling::Concurrent {
                concurrency: 3,
                frequency: Duration::from_secs(1),
            },
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                }
            },
        );
        tokio::time::sleep(Duration::from_millis(2500)).await;
        workers.shutdown().await.unwrap();
        // Immediate first tick plus ticks at 1s and 2s, per loop.
        assert_eq!(ticks.load(Ordering::SeqCst), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_all_loops() {
        let workers = Workers::spawn(
            "test",
            Polling::Concurrent {
                concurrency: 2,
                frequency: Duration::from_secs(1),
            },
            || async { Err::<bool, _>(Error::adapter("test", "source vanished")) },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(workers.is_cancelled());
        let err = workers.shutdown().await.unwrap_err();
        assert!(matches!(err, Error::Adapter { .. }));
    }

    #[test]
    fn adapter_error_keeps_special_kinds() {
        assert!(adapter_error("a", Error::Cancelled).is_cancelled());
        assert!(matches!(
            adapter_error("a", Error::message("io")),
            Error::Adapter { ref adapter, .. } if adapter == "a"
        ));
    }
}
