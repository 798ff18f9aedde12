//! Storage backends for the queue and process tables.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStorage;
pub use postgres::{PostgresRecordLookup, PostgresStorage};
