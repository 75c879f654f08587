use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::models::{Alert, DomainEvent};
use super::traits::{AlertSink, EventBus};
use crate::{Error, Result};

/// In-memory EventBus for local development and unit tests.
#[derive(Clone, Default)]
pub struct MemoryEventBus {
    events: Arc<Mutex<Vec<DomainEvent>>>,
    fail: Arc<Mutex<bool>>,
    capacity: Arc<Mutex<Option<usize>>>,
    latency: Arc<Mutex<Duration>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a snapshot of all emitted events (primarily for tests).
    pub async fn all_events(&self) -> Vec<DomainEvent> {
        self.events.lock().await.clone()
    }

    /// Make subsequent `emit` calls fail.
    pub async fn set_failing(&self, fail: bool) {
        *self.fail.lock().await = fail;
    }

    /// Reject every `emit` once `limit` events are held.
    pub async fn set_capacity(&self, limit: Option<usize>) {
        *self.capacity.lock().await = limit;
    }

    /// Delay each `emit`, like a remote bus would.
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.lock().await = latency;
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn emit(&self, event: DomainEvent) -> Result<()> {
        let latency = *self.latency.lock().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if *self.fail.lock().await {
            return Err(Error::BackendMessage("event bus unavailable".to_string()));
        }
        let capacity = *self.capacity.lock().await;
        let mut events = self.events.lock().await;
        if capacity.is_some_and(|limit| events.len() >= limit) {
            return Err(Error::BackendMessage("event bus full".to_string()));
        }
        events.push(event);
        Ok(())
    }
}

/// In-memory AlertSink that records every alert.
#[derive(Clone, Default)]
pub struct MemoryAlertSink {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn create_alert(&self, alert: Alert) -> Result<()> {
        self.alerts.lock().await.push(alert);
        Ok(())
    }
}

/// AlertSink that only writes alerts to the log. Used by the CLI when no
/// alerting backend is wired in.
#[derive(Clone, Default)]
pub struct LoggingAlertSink;

#[async_trait]
impl AlertSink for LoggingAlertSink {
    async fn create_alert(&self, alert: Alert) -> Result<()> {
        tracing::warn!(
            priority = alert.priority.as_str(),
            source = %alert.source,
            title = %alert.title,
            description = %alert.description,
            "alert raised"
        );
        Ok(())
    }
}

/// EventBus that writes each event to the log. Used by the CLI, where no
/// downstream consumer is attached.
#[derive(Clone, Default)]
pub struct LoggingEventBus;

#[async_trait]
impl EventBus for LoggingEventBus {
    async fn emit(&self, event: DomainEvent) -> Result<()> {
        tracing::info!(
            event_id = %event.id,
            event_type = event.event_type.as_str(),
            source_table = event.source_table().unwrap_or(""),
            source_id = event.source_id().unwrap_or(""),
            backfill = event.is_backfill(),
            "domain event"
        );
        Ok(())
    }
}
