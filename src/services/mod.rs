pub mod config;
pub mod directory;
pub mod logger;
pub mod metadata_store;
pub mod retry;
pub mod trust_store;
