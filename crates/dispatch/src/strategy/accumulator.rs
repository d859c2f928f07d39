//! Buffer envelopes and release them together.
//!
//! Without a time window a flush happens once `batch_size` invocations have
//! been stored or the custom completion check holds. With a window, the
//! first invocation opens it and the first invocation after it closes
//! triggers the flush. Stored items go out as one `Vec<Payload>` envelope or
//! one envelope each.

use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    switchyard_common::{Envelope, Error, Payload, Result},
    tracing::{debug, trace, warn},
};

#[cfg(feature = "metrics")]
use switchyard_metrics::{gauge, labels, strategy as strategy_metrics};

use {
    super::{MessageHandlingStrategy, StrategyContext, StrategyKind},
    crate::handler::Parameter,
};

pub const MAX_BATCH_SIZE: u16 = 256;
const MAX_WINDOW_DAYS: u64 = 9999;

fn strategy_error(message: impl fmt::Display) -> Error {
    Error::strategy(StrategyKind::Accumulator.as_str(), message)
}

// ── TimeWindow ──────────────────────────────────────────────────────────────

/// A window length written as `dd:hh:mm:ss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeWindow {
    seconds: u64,
}

impl TimeWindow {
    pub fn from_secs(seconds: u64) -> Self {
        Self { seconds }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.seconds)
    }

    fn as_delta(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.seconds).unwrap_or(i64::MAX / 1000))
    }
}

impl FromStr for TimeWindow {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let [days, hours, minutes, seconds] = parts.as_slice() else {
            return Err(strategy_error(format!("time window '{s}' is not dd:hh:mm:ss")));
        };
        let field = |value: &str, max: u64, what: &str| -> Result<u64> {
            let parsed: u64 = value
                .parse()
                .map_err(|_| strategy_error(format!("time window '{s}': {what} is not a number")))?;
            if parsed > max {
                return Err(strategy_error(format!("time window '{s}': {what} must be at most {max}")));
            }
            Ok(parsed)
        };
        let total = field(*days, MAX_WINDOW_DAYS, "days")? * 86_400
            + field(*hours, 23, "hours")? * 3_600
            + field(*minutes, 59, "minutes")? * 60
            + field(*seconds, 59, "seconds")?;
        if total == 0 {
            return Err(strategy_error(format!("time window '{s}' is empty")));
        }
        Ok(Self::from_secs(total))
    }
}

impl TryFrom<String> for TimeWindow {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimeWindow> for String {
    fn from(window: TimeWindow) -> Self {
        window.to_string()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.seconds;
        write!(
            f,
            "{:02}:{:02}:{:02}:{:02}",
            s / 86_400,
            (s % 86_400) / 3_600,
            (s % 3_600) / 60,
            s % 60
        )
    }
}

// ── Configuration ───────────────────────────────────────────────────────────

fn default_batch_size() -> u16 {
    1
}

fn default_batch() -> bool {
    true
}

/// Declarative accumulator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u16,
    #[serde(default)]
    pub unique_only: bool,
    #[serde(default)]
    pub window: Option<TimeWindow>,
    /// Where flushed items go. Falls back to the endpoint's output channel.
    #[serde(default)]
    pub destination: Option<String>,
    /// One list envelope per flush when true, one envelope per item otherwise.
    #[serde(default = "default_batch")]
    pub batch: bool,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            unique_only: false,
            window: None,
            destination: None,
            batch: default_batch(),
        }
    }
}

impl AccumulatorConfig {
    pub fn batch_of(batch_size: u16) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(strategy_error(format!(
                "batch size {} is outside 1..={MAX_BATCH_SIZE}",
                self.batch_size
            )));
        }
        Ok(())
    }
}

// ── Accumulator ─────────────────────────────────────────────────────────────

type CompletionCheck = Arc<dyn Fn(&[Envelope]) -> bool + Send + Sync>;

#[derive(Default)]
struct State {
    items: Vec<Envelope>,
    invocations: u32,
    window_start: Option<DateTime<Utc>>,
    window_end: Option<DateTime<Utc>>,
}

impl State {
    fn reset(&mut self) {
        self.items.clear();
        self.invocations = 0;
        self.window_start = None;
        self.window_end = None;
    }
}

pub struct Accumulator {
    config: AccumulatorConfig,
    payload_type: Option<Parameter>,
    completion: Option<CompletionCheck>,
    state: Mutex<State>,
}

impl fmt::Debug for Accumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accumulator")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Accumulator {
    pub fn new(config: AccumulatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            payload_type: None,
            completion: None,
            state: Mutex::new(State::default()),
        })
    }

    /// Only accept payloads of type `T`.
    #[must_use]
    pub fn payload_type<T: 'static>(mut self) -> Self {
        self.payload_type = Some(Parameter::of::<T>());
        self
    }

    /// Flush as soon as `check` holds for the stored items, in addition to
    /// the batch size. Ignored when a time window is configured.
    #[must_use]
    pub fn completion<F>(mut self, check: F) -> Self
    where
        F: Fn(&[Envelope]) -> bool + Send + Sync + 'static,
    {
        self.completion = Some(Arc::new(check));
        self
    }

    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    /// Number of stored, not yet flushed items.
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).items.len()
    }

    /// Store one envelope as of `now` and flush if complete. Returns the
    /// number of items flushed, if a flush happened.
    pub fn accumulate(&self, context: &StrategyContext, envelope: Envelope, now: DateTime<Utc>) -> Result<Option<usize>> {
        if let Some(Parameter::Typed { id, name }) = self.payload_type
            && envelope.body().type_id() != Some(id)
        {
            return Err(strategy_error(format!(
                "expected a {name} payload, got {}",
                envelope.body().type_name().unwrap_or("<empty>")
            )));
        }

        let destination = self.destination(context)?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.invocations += 1;
        state.items.push(envelope);

        let complete = match self.config.window {
            Some(window) => {
                let end = match state.window_end {
                    Some(end) => end,
                    None => {
                        let end = now + window.as_delta();
                        state.window_start = Some(now);
                        state.window_end = Some(end);
                        end
                    },
                };
                now > end
            },
            None => {
                state.invocations >= u32::from(self.config.batch_size)
                    || self.completion.as_ref().is_some_and(|check| check(&state.items))
            },
        };

        #[cfg(feature = "metrics")]
        gauge!(
            strategy_metrics::PENDING_ITEMS,
            labels::ENDPOINT => context.endpoint.name().to_string()
        )
        .set(if complete { 0.0 } else { state.items.len() as f64 });

        if !complete {
            trace!(endpoint = %context.endpoint.name(), pending = state.items.len(), "item accumulated");
            return Ok(None);
        }

        let taken = std::mem::take(&mut *state);
        drop(state);

        match self.flush(context, &destination, taken.items) {
            Ok(flushed) => {
                debug!(
                    endpoint = %context.endpoint.name(),
                    flushed,
                    window_opened = ?taken.window_start,
                    "accumulator flushed"
                );
                context.completed(StrategyKind::Accumulator, Some(destination), None);
                Ok(Some(flushed))
            },
            Err((err, unsent)) => {
                warn!(
                    endpoint = %context.endpoint.name(),
                    unsent = unsent.len(),
                    error = %err,
                    "accumulator flush failed, keeping unsent items"
                );
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let arrived = std::mem::replace(&mut state.items, unsent);
                state.items.extend(arrived);
                state.invocations += taken.invocations;
                if state.window_end.is_none() {
                    state.window_start = taken.window_start;
                    state.window_end = taken.window_end;
                }
                Err(err)
            },
        }
    }

    fn destination(&self, context: &StrategyContext) -> Result<String> {
        match &self.config.destination {
            Some(destination) => Ok(destination.clone()),
            None => context.require_output(StrategyKind::Accumulator).map(str::to_string),
        }
    }

    /// Send the items to `destination`. On failure the items not yet sent come
    /// back with the error.
    fn flush(
        &self,
        context: &StrategyContext,
        destination: &str,
        mut items: Vec<Envelope>,
    ) -> std::result::Result<usize, (Error, Vec<Envelope>)> {
        if self.config.unique_only {
            let mut unique: Vec<Envelope> = Vec::with_capacity(items.len());
            for item in items {
                if !unique.iter().any(|kept| kept.body() == item.body()) {
                    unique.push(item);
                }
            }
            items = unique;
        }
        let count = items.len();
        if self.config.batch {
            if let Some(first) = items.first() {
                let bodies: Vec<Payload> = items.iter().map(|item| item.body().clone()).collect();
                let batch = first.correlated(Payload::new(bodies));
                if let Err(err) = context.send(destination, batch) {
                    return Err((err, items));
                }
            }
        } else {
            for (sent, item) in items.iter().enumerate() {
                if let Err(err) = context.send(destination, item.correlated(item.body().clone())) {
                    return Err((err, items.split_off(sent)));
                }
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl MessageHandlingStrategy for Accumulator {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Accumulator
    }

    async fn handle(&self, context: &StrategyContext, envelope: Envelope) -> Result<()> {
        self.accumulate(context, envelope, Utc::now()).map(|_| ())
    }

    fn cleanup(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).reset();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::strategy::test_support,
        rstest::rstest,
        switchyard_common::{BusEvent, EventKind, EventObserver, RecordingObserver},
    };

    fn accumulator(config: AccumulatorConfig) -> (Accumulator, StrategyContext) {
        (
            Accumulator::new(config).unwrap(),
            test_support::context(test_support::passthrough(), Some("batches")),
        )
    }

    #[rstest]
    #[case("00:00:00:30", 30)]
    #[case("01:02:03:04", 93_784)]
    #[case(" 00:01:00:00 ", 3_600)]
    fn parses_windows(#[case] input: &str, #[case] seconds: u64) {
        let window: TimeWindow = input.parse().unwrap();
        assert_eq!(window.as_duration(), Duration::from_secs(seconds));
        assert_eq!(window.to_string().parse::<TimeWindow>().unwrap(), window);
    }

    #[rstest]
    #[case("30")]
    #[case("00:00:30")]
    #[case("00:24:00:00")]
    #[case("00:00:60:00")]
    #[case("00:00:00:00")]
    #[case("aa:00:00:01")]
    fn rejects_bad_windows(#[case] input: &str) {
        assert!(input.parse::<TimeWindow>().is_err());
    }

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    #[case(256, true)]
    #[case(257, false)]
    fn batch_size_bounds(#[case] size: u16, #[case] ok: bool) {
        assert_eq!(Accumulator::new(AccumulatorConfig::batch_of(size)).is_ok(), ok);
    }

    #[tokio::test]
    async fn flushes_once_per_batch_and_empties() {
        let (acc, context) = accumulator(AccumulatorConfig::batch_of(3));
        let recorder = RecordingObserver::new("recorder");
        context.events.subscribe(recorder.clone());

        for n in 1..=2_u32 {
            acc.handle(&context, Envelope::new(n)).await.unwrap();
        }
        assert!(context.channels.get("batches").is_none());
        assert_eq!(acc.pending(), 2);

        acc.handle(&context, Envelope::new(3_u32)).await.unwrap();
        assert_eq!(acc.pending(), 0);
        let batches = context.channels.get("batches").unwrap().drain();
        assert_eq!(batches.len(), 1);
        let values: Vec<u32> = batches[0]
            .payload::<Vec<Payload>>()
            .unwrap()
            .iter()
            .map(|p| *p.get::<u32>().unwrap())
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(recorder.events_of(EventKind::StrategyCompleted).len(), 1);
    }

    #[tokio::test]
    async fn individual_unique_flush() {
        let config = AccumulatorConfig {
            batch_size: 4,
            unique_only: true,
            batch: false,
            destination: Some("singles".into()),
            ..AccumulatorConfig::default()
        };
        let (acc, context) = accumulator(config);
        for word in ["a", "b", "a", "c"] {
            acc.handle(&context, Envelope::new(word.to_string())).await.unwrap();
        }
        let out: Vec<String> = context
            .channels
            .get("singles")
            .unwrap()
            .drain()
            .iter()
            .map(|e| e.payload::<String>().unwrap().clone())
            .collect();
        assert_eq!(out, vec!["a", "b", "c"]);
    }

    #[test]
    fn custom_completion_flushes_early() {
        let (acc, context) = accumulator(AccumulatorConfig::batch_of(100));
        let acc = acc.completion(|items| items.iter().any(|e| e.payload::<String>().is_some_and(|s| s == "end")));
        let now = Utc::now();
        assert_eq!(acc.accumulate(&context, Envelope::new("x".to_string()), now).unwrap(), None);
        assert_eq!(acc.accumulate(&context, Envelope::new("end".to_string()), now).unwrap(), Some(2));
    }

    #[test]
    fn window_flushes_after_it_closes() {
        let config = AccumulatorConfig {
            window: Some("00:00:01:00".parse().unwrap()),
            ..AccumulatorConfig::default()
        };
        let (acc, context) = accumulator(config);
        let start = Utc::now();
        for offset in [0, 10, 60] {
            let now = start + chrono::Duration::seconds(offset);
            assert_eq!(acc.accumulate(&context, Envelope::new(1_u32), now).unwrap(), None);
        }
        let late = start + chrono::Duration::seconds(61);
        assert_eq!(acc.accumulate(&context, Envelope::new(2_u32), late).unwrap(), Some(4));
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn wrong_payload_type_is_rejected() {
        let (acc, context) = accumulator(AccumulatorConfig::batch_of(2));
        let acc = acc.payload_type::<u32>();
        let err = acc.accumulate(&context, Envelope::new("x".to_string()), Utc::now()).unwrap_err();
        assert!(matches!(err, Error::Strategy { .. }));
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn missing_destination_rejects_before_storing() {
        let acc = Accumulator::new(AccumulatorConfig::batch_of(3)).unwrap();
        let context = test_support::context(test_support::passthrough(), None);
        let err = acc.accumulate(&context, Envelope::new(1_u32), Utc::now()).unwrap_err();
        assert!(matches!(err, Error::Strategy { .. }));
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn failed_flush_keeps_the_batch() {
        let (acc, context) = accumulator(AccumulatorConfig::batch_of(2));
        let batches = context.channels.find_or_create("batches");
        batches.close();

        acc.accumulate(&context, Envelope::new(1_u32), Utc::now()).unwrap();
        let err = acc.accumulate(&context, Envelope::new(2_u32), Utc::now()).unwrap_err();
        assert!(matches!(err, Error::Channel { .. }));
        assert_eq!(acc.pending(), 2);

        batches.reopen();
        assert_eq!(acc.accumulate(&context, Envelope::new(3_u32), Utc::now()).unwrap(), Some(3));
        let values: Vec<u32> = batches.drain()[0]
            .payload::<Vec<Payload>>()
            .unwrap()
            .iter()
            .map(|p| *p.get::<u32>().unwrap())
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(acc.pending(), 0);
    }

    struct PendingWatcher {
        accumulator: Arc<Accumulator>,
        seen: Mutex<Option<usize>>,
    }

    impl EventObserver for PendingWatcher {
        fn name(&self) -> &str {
            "pending"
        }

        fn events(&self) -> &[EventKind] {
            &[EventKind::StrategyCompleted]
        }

        fn on_event(&self, _event: &BusEvent) {
            *self.seen.lock().unwrap() = Some(self.accumulator.pending());
        }
    }

    #[test]
    fn observers_can_inspect_state_during_flush() {
        let (acc, context) = accumulator(AccumulatorConfig::batch_of(2));
        let acc = Arc::new(acc);
        let observer = Arc::new(PendingWatcher {
            accumulator: Arc::clone(&acc),
            seen: Mutex::new(None),
        });
        context.events.subscribe(observer.clone());

        acc.accumulate(&context, Envelope::new(1_u32), Utc::now()).unwrap();
        acc.accumulate(&context, Envelope::new(2_u32), Utc::now()).unwrap();
        assert_eq!(*observer.seen.lock().unwrap(), Some(0));
    }

    #[test]
    fn cleanup_discards_pending_items() {
        let (acc, context) = accumulator(AccumulatorConfig::batch_of(5));
        acc.accumulate(&context, Envelope::new(1_u32), Utc::now()).unwrap();
        acc.cleanup();
        assert_eq!(acc.pending(), 0);
    }
}
