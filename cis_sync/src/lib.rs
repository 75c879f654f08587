//! Read-only synchronization from an external marketplace database into local
//! domain events.
//!
//! The external source is only ever read: every statement goes through
//! [`external::GuardedConnection`], which enforces a SELECT-only verb guard, a
//! query-template allowlist and a circuit breaker before a driver sees it.

pub mod config;
pub mod error;
pub mod events;
pub mod external;
pub mod health;
pub mod mappings;
pub mod orchestrator;
pub mod poller;
pub mod schema;
pub mod store;
pub mod telemetry;
pub mod transformer;

#[cfg(test)]
mod test_support;

pub use config::{BreakerConfig, ExternalDbConfig, ExternalDialect, SyncConfig, WatermarkPolicy};
pub use error::{Error, Result};
pub use events::{Alert, AlertPriority, AlertSink, DomainEvent, EventBus, EventType};
pub use external::{BreakerSnapshot, BreakerState, GuardedConnection, PrivilegeReport};
pub use health::{HealthIssue, HealthMonitor, HealthReport};
pub use mappings::{MappingRegistry, TableMapping};
pub use orchestrator::{CycleReport, SyncService, SyncStatus};
pub use store::{MemorySyncStore, SqliteSyncStore, SyncRunRecord, SyncStore, Watermark};
