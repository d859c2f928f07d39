//! Split-select-combine over the items of one list payload.
//!
//! Each item travels in its own envelope numbered `1..=N` of `N` and
//! correlated to the initiating message. Items are visited in order until
//! the correlation check fails or the completion check holds; the selections
//! are then combined exactly once.

use std::sync::Arc;

use {
    async_trait::async_trait,
    switchyard_common::{Envelope, Error, EventKind, Payload, PayloadValue, Result},
    tracing::{debug, warn},
};

use super::{MessageHandlingStrategy, StrategyContext, StrategyKind};

/// Header item set on the combined envelope when iteration stopped at a
/// correlation mismatch.
pub const TRUNCATED_ITEM: &str = "aggregation-truncated";

type ItemExtractor = Arc<dyn Fn(&Envelope) -> Option<Vec<Payload>> + Send + Sync>;
type CorrelationCheck = Arc<dyn Fn(&Envelope, &Envelope) -> bool + Send + Sync>;
type CompletionCheck = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;
type Selector = Arc<dyn Fn(&Envelope) -> Option<Payload> + Send + Sync>;
type Combiner = Arc<dyn Fn(Vec<Payload>) -> Payload + Send + Sync>;

pub struct Aggregator {
    items: ItemExtractor,
    correlation: CorrelationCheck,
    selector: Option<Selector>,
    completion: CompletionCheck,
    combine: Combiner,
    send_to_output: bool,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("custom_selector", &self.selector.is_some())
            .field("send_to_output", &self.send_to_output)
            .finish()
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    /// Items come from a `Vec<Payload>` body, the method selects, and the
    /// selections are combined into a `Vec<Payload>`.
    pub fn new() -> Self {
        Self {
            items: Arc::new(|envelope: &Envelope| envelope.payload::<Vec<Payload>>().cloned()),
            correlation: Arc::new(|initiating: &Envelope, item: &Envelope| {
                item.header.correlation_id.as_deref() == Some(initiating.header.message_id())
            }),
            selector: None,
            completion: Arc::new(|item: &Envelope| item.header.sequence_number == item.header.sequence_size),
            combine: Arc::new(|selections: Vec<Payload>| Payload::new(selections)),
            send_to_output: true,
        }
    }

    /// Read the items from a `Vec<T>` body.
    #[must_use]
    pub fn items_of<T: PayloadValue + Clone>(self) -> Self {
        self.items(|envelope| {
            envelope
                .payload::<Vec<T>>()
                .map(|values| values.iter().cloned().map(Payload::new).collect())
        })
    }

    /// Locate the items with a custom extractor, e.g. a field of the body.
    #[must_use]
    pub fn items<F>(mut self, extract: F) -> Self
    where
        F: Fn(&Envelope) -> Option<Vec<Payload>> + Send + Sync + 'static,
    {
        self.items = Arc::new(extract);
        self
    }

    /// Replace the correlation check, called with the initiating envelope and
    /// the item envelope.
    #[must_use]
    pub fn correlation<F>(mut self, check: F) -> Self
    where
        F: Fn(&Envelope, &Envelope) -> bool + Send + Sync + 'static,
    {
        self.correlation = Arc::new(check);
        self
    }

    /// Select with a function instead of invoking the handler method.
    #[must_use]
    pub fn selector<F>(mut self, select: F) -> Self
    where
        F: Fn(&Envelope) -> Option<Payload> + Send + Sync + 'static,
    {
        self.selector = Some(Arc::new(select));
        self
    }

    #[must_use]
    pub fn completion<F>(mut self, check: F) -> Self
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        self.completion = Arc::new(check);
        self
    }

    #[must_use]
    pub fn combine<F>(mut self, combine: F) -> Self
    where
        F: Fn(Vec<Payload>) -> Payload + Send + Sync + 'static,
    {
        self.combine = Arc::new(combine);
        self
    }

    /// Hand the combined envelope to StrategyCompleted observers instead of
    /// sending it. With no such observer it is sent to the output channel.
    #[must_use]
    pub fn notify_only(mut self) -> Self {
        self.send_to_output = false;
        self
    }

    /// Walk the items and return the combined envelope.
    pub async fn aggregate(&self, context: &StrategyContext, initiating: &Envelope) -> Result<Envelope> {
        let items = (self.items)(initiating).ok_or_else(|| {
            Error::strategy(
                StrategyKind::Aggregator.as_str(),
                format!(
                    "message {} carries no item list",
                    initiating.header.message_id()
                ),
            )
        })?;
        let size = u32::try_from(items.len()).unwrap_or(u32::MAX);
        let mut selections = Vec::new();
        let mut truncated = false;

        for (number, item) in (1..=size).zip(items) {
            let mut item = Envelope::from_payload(item);
            item.header.correlation_id = Some(initiating.header.message_id().to_string());
            item.header.set_sequence(number, size);

            if !(self.correlation)(initiating, &item) {
                warn!(
                    endpoint = %context.endpoint.name(),
                    message_id = initiating.header.message_id(),
                    item = number,
                    size,
                    "correlation check failed, aggregation truncated"
                );
                truncated = true;
                break;
            }

            let selection = match &self.selector {
                Some(select) => select(&item),
                None => context.method.invoke(item.clone()).await?,
            };
            if let Some(selection) = selection {
                selections.push(selection);
            }

            if (self.completion)(&item) {
                break;
            }
        }

        debug!(
            endpoint = %context.endpoint.name(),
            selected = selections.len(),
            size,
            truncated,
            "aggregation complete"
        );
        let mut combined = initiating.correlated((self.combine)(selections));
        if truncated {
            combined.header.set_item(TRUNCATED_ITEM, "true");
        }
        Ok(combined)
    }
}

#[async_trait]
impl MessageHandlingStrategy for Aggregator {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Aggregator
    }

    async fn handle(&self, context: &StrategyContext, envelope: Envelope) -> Result<()> {
        let combined = self.aggregate(context, &envelope).await?;
        if !self.send_to_output && context.events.has_observers(EventKind::StrategyCompleted) {
            context.completed(self.kind(), None, Some(combined));
            return Ok(());
        }
        let channel = context.require_output(self.kind())?.to_string();
        context.send(&channel, combined)?;
        context.completed(self.kind(), Some(channel), None);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::{handler::HandlerMethod, strategy::test_support},
        std::sync::{
            Mutex,
            atomic::{AtomicU32, Ordering},
        },
        switchyard_common::{BusEvent, EventKind, RecordingObserver},
    };

    fn numbers(values: &[u32]) -> Envelope {
        Envelope::new(values.iter().copied().map(Payload::new).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn combines_once_with_every_selection_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let method = HandlerMethod::envelope("double", move |item: Envelope| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push((item.header.sequence_number, item.header.sequence_size));
                let n = *item.payload::<u32>().unwrap();
                Ok::<_, Error>(Some(Payload::new(n * 2)))
            }
        });
        let combines = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&combines);
        let aggregator = Aggregator::new().combine(move |selections| {
            counter.fetch_add(1, Ordering::SeqCst);
            Payload::new(selections)
        });
        let context = test_support::context(method, Some("totals"));

        let input = numbers(&[1, 2, 3]);
        aggregator.handle(&context, input.clone()).await.unwrap();

        assert_eq!(combines.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
        let out = context.channels.get("totals").unwrap().try_receive().unwrap();
        let values: Vec<u32> = out
            .payload::<Vec<Payload>>()
            .unwrap()
            .iter()
            .map(|p| *p.get::<u32>().unwrap())
            .collect();
        assert_eq!(values, vec![2, 4, 6]);
        assert_eq!(out.header.correlation_id.as_deref(), Some(input.header.message_id()));
        assert!(out.header.item(TRUNCATED_ITEM).is_none());
    }

    #[tokio::test]
    async fn none_selections_are_skipped() {
        let aggregator = Aggregator::new()
            .selector(|item| item.payload::<u32>().filter(|n| **n % 2 == 1).map(|n| Payload::new(*n)));
        let context = test_support::context(test_support::passthrough(), Some("odd"));
        let combined = aggregator.aggregate(&context, &numbers(&[1, 2, 3, 4])).await.unwrap();
        assert_eq!(combined.payload::<Vec<Payload>>().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn completion_stops_early() {
        let aggregator = Aggregator::new().completion(|item| item.header.sequence_number == 2);
        let context = test_support::context(test_support::passthrough(), None);
        let combined = aggregator.aggregate(&context, &numbers(&[1, 2, 3])).await.unwrap();
        assert_eq!(combined.payload::<Vec<Payload>>().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn correlation_failure_truncates_and_flags() {
        let aggregator = Aggregator::new().correlation(|_, item| item.header.sequence_number < 3);
        let context = test_support::context(test_support::passthrough(), None);
        let combined = aggregator.aggregate(&context, &numbers(&[1, 2, 3, 4])).await.unwrap();
        assert_eq!(combined.payload::<Vec<Payload>>().unwrap().len(), 2);
        assert_eq!(combined.header.item(TRUNCATED_ITEM), Some("true"));
    }

    #[tokio::test]
    async fn typed_lists_and_notify_only() {
        let aggregator = Aggregator::new().items_of::<String>().notify_only();
        let context = test_support::context(test_support::passthrough(), None);
        let recorder = RecordingObserver::new("recorder");
        context.events.subscribe(recorder.clone());

        aggregator
            .handle(&context, Envelope::new(vec!["a".to_string(), "b".to_string()]))
            .await
            .unwrap();

        let completed = recorder.events_of(EventKind::StrategyCompleted);
        assert_eq!(completed.len(), 1);
        let BusEvent::StrategyCompleted { envelope: Some(envelope), channel: None, .. } = &completed[0] else {
            panic!("expected a surfaced envelope");
        };
        assert_eq!(envelope.payload::<Vec<Payload>>().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn notify_only_without_observer_sends_to_output() {
        let aggregator = Aggregator::new().items_of::<String>().notify_only();
        let context = test_support::context(test_support::passthrough(), Some("out"));

        aggregator
            .handle(&context, Envelope::new(vec!["a".to_string()]))
            .await
            .unwrap();

        let out = context.channels.get("out").unwrap().try_receive().unwrap();
        assert_eq!(out.payload::<Vec<Payload>>().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn notify_only_without_observer_or_output_is_an_error() {
        let aggregator = Aggregator::new().items_of::<String>().notify_only();
        let context = test_support::context(test_support::passthrough(), None);
        let err = aggregator
            .handle(&context, Envelope::new(vec!["a".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Strategy { .. }));
    }

    #[tokio::test]
    async fn non_list_payload_is_strategy_error() {
        let context = test_support::context(test_support::passthrough(), Some("out"));
        let err = Aggregator::new()
            .handle(&context, Envelope::new(5_u32))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Strategy { .. }));
    }
}
