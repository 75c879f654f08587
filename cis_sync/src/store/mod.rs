pub mod memory;
pub mod models;
pub mod sqlite;
pub mod traits;

pub use memory::MemorySyncStore;
pub use models::{LocalCategory, LocalUser, SyncRunRecord, Watermark, WatermarkAdvance};
pub use sqlite::SqliteSyncStore;
pub use traits::SyncStore;
