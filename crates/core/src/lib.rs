pub mod config;
pub mod error;
pub mod panic;
pub mod ring;
pub mod store;

pub use config::{StorageBackendKind, StorageConfig};
pub use error::StoreError;
pub use panic::panic_message;
pub use ring::RingBuffer;
pub use store::{open_store, DurableStore, FileStore, MemoryStore};

/// Unique identifier of a registered task.
pub type TaskId = String;

/// Identifier of the agent role that owns a task. Reference only.
pub type AgentId = String;
