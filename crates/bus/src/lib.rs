//! APGMS Event Bus - In-process domain event distribution
//!
//! Tells other subsystems (cache invalidation, alerting) that ledger state changed.
//!
//! # Guarantees
//! - Publishing never blocks the caller and never fails a ledger write
//! - Delivery is at-most-once per subscriber; slow subscribers lag and skip
//! - An optional JSONL event log keeps a durable copy of every envelope

pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod log;
pub mod subscriber;

pub use channel::{EventBus, EventEmitter, EventPublisher};
pub use config::EventsConfig;
pub use error::BusError;
pub use event::{DomainEvent, EventEnvelope, EventPriority, PublishedEvent};
pub use log::{EventLog, EventLogSubscriber};
pub use subscriber::EventSubscriber;
