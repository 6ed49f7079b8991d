//! Message bus contract for engine events and an in-process implementation.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::entity::{EvaluatorRecordCorrectionEvent, ExptAggrCalculateEvent, ExptScheduleEvent};
use crate::error::Error;

#[async_trait]
pub trait ExptEventPublisher: Send + Sync {
    /// Publishes a schedule event delivered after `delay`.
    async fn publish_schedule_event(
        &self,
        event: &ExptScheduleEvent,
        delay: Option<Duration>,
    ) -> Result<(), Error>;

    async fn publish_aggr_calculate_events(
        &self,
        events: &[ExptAggrCalculateEvent],
        delay: Option<Duration>,
    ) -> Result<(), Error>;

    async fn publish_record_correction_event(
        &self,
        event: &EvaluatorRecordCorrectionEvent,
        delay: Option<Duration>,
    ) -> Result<(), Error>;
}

/// Envelope kept by `InMemoryEventBus`.
#[derive(Clone, Debug, PartialEq)]
pub enum PublishedEvent {
    Schedule(ExptScheduleEvent),
    AggrCalculate(ExptAggrCalculateEvent),
    RecordCorrection(EvaluatorRecordCorrectionEvent),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub event: PublishedEvent,
    pub delay: Option<Duration>,
}

/// Queues events in publish order. Consumers pull with `drain`, which also
/// makes the bus usable as a deterministic driver in tests.
#[derive(Default)]
pub struct InMemoryEventBus {
    queue: Mutex<Vec<Delivery>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn drain(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.queue.lock().await)
    }

    pub async fn pending(&self) -> Vec<Delivery> {
        self.queue.lock().await.clone()
    }

    async fn push(&self, event: PublishedEvent, delay: Option<Duration>) {
        tracing::debug!(?event, ?delay, "Queued event");
        self.queue.lock().await.push(Delivery { event, delay });
    }
}

#[async_trait]
impl ExptEventPublisher for InMemoryEventBus {
    async fn publish_schedule_event(
        &self,
        event: &ExptScheduleEvent,
        delay: Option<Duration>,
    ) -> Result<(), Error> {
        self.push(PublishedEvent::Schedule(event.clone()), delay)
            .await;
        Ok(())
    }

    async fn publish_aggr_calculate_events(
        &self,
        events: &[ExptAggrCalculateEvent],
        delay: Option<Duration>,
    ) -> Result<(), Error> {
        for event in events {
            self.push(PublishedEvent::AggrCalculate(event.clone()), delay)
                .await;
        }
        Ok(())
    }

    async fn publish_record_correction_event(
        &self,
        event: &EvaluatorRecordCorrectionEvent,
        delay: Option<Duration>,
    ) -> Result<(), Error> {
        self.push(PublishedEvent::RecordCorrection(event.clone()), delay)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ExptRunMode;

    #[tokio::test]
    async fn test_drain_preserves_publish_order() {
        let bus = InMemoryEventBus::new();
        let event = ExptScheduleEvent {
            expt_id: 1,
            expt_run_id: 2,
            expt_run_mode: ExptRunMode::FailRetry,
            ..Default::default()
        };
        bus.publish_schedule_event(&event, Some(Duration::from_secs(3)))
            .await
            .unwrap();
        bus.publish_aggr_calculate_events(&[ExptAggrCalculateEvent::default()], None)
            .await
            .unwrap();

        let deliveries = bus.drain().await;
        assert_eq!(deliveries.len(), 2);
        assert_eq!(
            deliveries[0],
            Delivery {
                event: PublishedEvent::Schedule(event),
                delay: Some(Duration::from_secs(3)),
            }
        );
        assert!(bus.drain().await.is_empty(), "drain should empty the queue");
    }
}
