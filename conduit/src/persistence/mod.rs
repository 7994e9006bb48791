pub mod memory;
pub mod record;

pub use memory::MemoryBackend;
pub use record::{PersistedRecord, namespace_prefix, storage_key};
