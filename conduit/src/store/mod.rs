pub mod ttl_store;

pub use ttl_store::TtlStore;
