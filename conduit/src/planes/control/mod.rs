pub mod operation;
pub mod registry;

pub use operation::CacheManagement;
pub use registry::{Registry, RegistryBuilder};
