pub mod file_metadata_store;
pub mod memory_metadata_store;
