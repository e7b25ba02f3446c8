//! Event subscriber trait for async event handling

use crate::error::BusError;
use crate::event::PublishedEvent;
use async_trait::async_trait;

/// Trait for event subscribers
///
/// Subscribers receive events from the event bus and process them asynchronously.
/// Delivery is at-most-once, so a subscriber that needs every event should also
/// read the event log.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Get the subscriber name (for logging)
    fn name(&self) -> &str;

    /// Handle a published event
    async fn handle(&self, event: &PublishedEvent) -> Result<(), BusError>;
}
