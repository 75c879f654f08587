//! Domain events emitted by the sync, and the two outbound contracts it talks to:
//! the event bus (risk scoring consumes from it) and the alerting subsystem.

pub mod memory;
pub mod models;
pub mod traits;

pub use models::{Alert, AlertPriority, DomainEvent, EventType};
pub use traits::{AlertSink, EventBus};
