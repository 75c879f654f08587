//! Guarded, read-only access to the external marketplace database.

pub mod breaker;
pub mod connection;
pub mod dialect;
pub mod guard;
pub mod models;
pub mod mysql;
pub mod postgres;
pub mod traits;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use connection::GuardedConnection;
pub use models::{PrivilegeReport, QueryResult, SqlParam};
pub use traits::ExternalDriver;
