//! Domain events for pub/sub distribution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Delivery priority hint for subscribers (alerting routes `High` to on-call)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    #[default]
    Routine,
    High,
}

/// Wire envelope received by every subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Globally unique event id
    pub id: String,
    pub tenant_id: String,
    pub event_type: String,
    /// Partition/dedupe key, usually the affected resource id
    pub key: String,
    pub ts: DateTime<Utc>,
    pub schema_version: String,
    pub source: String,
    pub dedupe_id: String,
    #[serde(default)]
    pub priority: EventPriority,
    pub payload: Value,
}

/// An envelope together with the subject it was published on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub subject: String,
    pub envelope: EventEnvelope,
}

/// What a component wants to announce; the emitter turns it into an envelope
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    /// Subject without the configured prefix
    pub subject: String,
    pub event_type: String,
    pub tenant_id: String,
    pub key: String,
    pub priority: EventPriority,
    pub payload: Value,
}

impl DomainEvent {
    /// Create a routine-priority event whose type equals its subject
    pub fn new(
        subject: impl Into<String>,
        tenant_id: impl Into<String>,
        key: impl Into<String>,
        payload: Value,
    ) -> Self {
        let subject = subject.into();
        Self {
            event_type: subject.clone(),
            subject,
            tenant_id: tenant_id.into(),
            key: key.into(),
            priority: EventPriority::Routine,
            payload,
        }
    }

    /// Override the event type
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Mark as high priority
    pub fn high_priority(mut self) -> Self {
        self.priority = EventPriority::High;
        self
    }
}
