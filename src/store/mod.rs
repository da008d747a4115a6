//! Session store implementations.
//!
//! - [`InMemorySessionStore`]: shared in-process map
//! - [`SqliteSessionStore`]: durable single-file store

mod memory;
mod schema;
mod sqlite;

pub use memory::InMemorySessionStore;
pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use sqlite::SqliteSessionStore;
