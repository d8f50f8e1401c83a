//! Infrastructure layer - Storage adapters
//!
//! - `memory`: in-process maps, for tests and embedded use
//! - `sqlite`: file-backed persistence (default `sqlite` feature)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{InMemoryBulkQueue, InMemoryRecordStore};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteBulkQueue, SqliteRecordStore};
