use async_trait::async_trait;

use super::models::{Alert, DomainEvent};
use crate::Result;

/// Outbound event bus. Delivery beyond `emit` is the bus's concern.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn emit(&self, event: DomainEvent) -> Result<()>;
}

/// External alerting subsystem.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn create_alert(&self, alert: Alert) -> Result<()>;
}
