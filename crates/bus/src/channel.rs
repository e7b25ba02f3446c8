//! In-process event bus
//!
//! A tokio broadcast channel fans envelopes out to subscribers. Sending never
//! waits: a subscriber that falls more than `channel_capacity` events behind
//! skips the overflow and logs the gap.

use crate::config::EventsConfig;
use crate::error::BusError;
use crate::event::{DomainEvent, EventEnvelope, PublishedEvent};
use crate::subscriber::EventSubscriber;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Sink for domain events
///
/// Implementations must return promptly; callers treat errors as log-only.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, subject: &str, envelope: EventEnvelope) -> Result<(), BusError>;
}

/// Event bus for distributing domain events
pub struct EventBus {
    sender: broadcast::Sender<PublishedEvent>,
}

impl EventBus {
    /// Create a new event bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Raw receiver for every published event
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Number of live receivers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Drive `subscriber` from a background task until the bus is dropped
    pub fn spawn_subscriber(&self, subscriber: Arc<dyn EventSubscriber>) -> JoinHandle<()> {
        let mut receiver = self.sender.subscribe();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if let Err(e) = subscriber.handle(&event).await {
                            tracing::warn!(
                                subscriber = subscriber.name(),
                                subject = %event.subject,
                                error = %e,
                                "Subscriber failed to handle event"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            subscriber = subscriber.name(),
                            skipped,
                            "Subscriber lagged behind the event bus"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            tracing::debug!(subscriber = subscriber.name(), "Subscriber stopped");
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventsConfig::default().channel_capacity)
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, subject: &str, envelope: EventEnvelope) -> Result<(), BusError> {
        if subject.trim().is_empty() {
            return Err(BusError::EmptySubject);
        }

        let event = PublishedEvent {
            subject: subject.to_string(),
            envelope,
        };

        // No receivers is not a failure: nobody is listening yet.
        if self.sender.send(event).is_err() {
            tracing::debug!(subject, "Event published with no subscribers");
        }

        Ok(())
    }
}

/// Builds envelopes from [`DomainEvent`]s and publishes them, logging failures
#[derive(Clone)]
pub struct EventEmitter {
    publisher: Arc<dyn EventPublisher>,
    config: EventsConfig,
}

impl EventEmitter {
    pub fn new(publisher: Arc<dyn EventPublisher>, config: EventsConfig) -> Self {
        Self { publisher, config }
    }

    /// Build the wire envelope for an event
    pub fn envelope(&self, event: &DomainEvent) -> EventEnvelope {
        EventEnvelope {
            id: Uuid::new_v4().to_string(),
            tenant_id: event.tenant_id.clone(),
            event_type: event.event_type.clone(),
            key: event.key.clone(),
            ts: Utc::now(),
            schema_version: self.config.schema_version.clone(),
            source: self.config.source.clone(),
            dedupe_id: event.key.clone(),
            priority: event.priority,
            payload: event.payload.clone(),
        }
    }

    /// Publish an event; returns whether the publisher accepted it
    pub fn emit(&self, event: DomainEvent) -> bool {
        let subject = self.config.full_subject(&event.subject);
        let envelope = self.envelope(&event);

        match self.publisher.publish(&subject, envelope) {
            Ok(()) => {
                tracing::debug!(
                    subject = %subject,
                    event_type = %event.event_type,
                    tenant_id = %event.tenant_id,
                    "Domain event published"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    subject = %subject,
                    tenant_id = %event.tenant_id,
                    error = %e,
                    "Domain event publish failed"
                );
                false
            }
        }
    }

    pub fn config(&self) -> &EventsConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPriority;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FailingPublisher;

    impl EventPublisher for FailingPublisher {
        fn publish(&self, _subject: &str, _envelope: EventEnvelope) -> Result<(), BusError> {
            Err(BusError::SendFailed("broker unavailable".to_string()))
        }
    }

    struct CountingSubscriber {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventSubscriber for CountingSubscriber {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(&self, _event: &PublishedEvent) -> Result<(), BusError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = Arc::new(EventBus::new(8));
        let emitter = EventEmitter::new(bus, EventsConfig::default());

        let accepted = emitter.emit(DomainEvent::new("reconciliation.completed", "org-1", "k", json!({})));
        assert!(accepted);
    }

    #[tokio::test]
    async fn test_emit_prefixes_subject_and_fills_envelope() {
        let bus = Arc::new(EventBus::new(8));
        let mut receiver = bus.subscribe();
        let emitter = EventEmitter::new(bus.clone(), EventsConfig::default());

        emitter.emit(
            DomainEvent::new("reconciliation.shortfall", "org-1", "artifact-9", json!({ "shortfall": 20000 }))
                .high_priority(),
        );

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.subject, "apgms.dev.reconciliation.shortfall");
        assert_eq!(event.envelope.tenant_id, "org-1");
        assert_eq!(event.envelope.dedupe_id, "artifact-9");
        assert_eq!(event.envelope.priority, EventPriority::High);
        assert_eq!(event.envelope.payload["shortfall"], 20000);
    }

    #[tokio::test]
    async fn test_failing_publisher_is_log_only() {
        let emitter = EventEmitter::new(Arc::new(FailingPublisher), EventsConfig::default());
        let accepted = emitter.emit(DomainEvent::new("x.y", "org-1", "k", json!(null)));
        assert!(!accepted);
    }

    #[tokio::test]
    async fn test_empty_subject_rejected() {
        let bus = EventBus::new(4);
        let emitter = EventEmitter::new(Arc::new(EventBus::new(4)), EventsConfig::default());
        let envelope = emitter.envelope(&DomainEvent::new("a", "org-1", "k", json!({})));
        assert!(matches!(bus.publish("  ", envelope), Err(BusError::EmptySubject)));
    }

    #[tokio::test]
    async fn test_spawned_subscriber_receives_events() {
        let bus = Arc::new(EventBus::new(16));
        let subscriber = Arc::new(CountingSubscriber {
            seen: AtomicUsize::new(0),
        });
        let handle = bus.spawn_subscriber(subscriber.clone());
        let emitter = EventEmitter::new(bus.clone(), EventsConfig::default());

        for i in 0..3 {
            emitter.emit(DomainEvent::new("designated_account.contribution_applied", "org-1", format!("c-{}", i), json!({})));
        }

        for _ in 0..50 {
            if subscriber.seen.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(subscriber.seen.load(Ordering::SeqCst), 3);

        drop(emitter);
        drop(bus);
        handle.await.unwrap();
    }
}
