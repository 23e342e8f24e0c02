//! redb table definitions for the Tidepool state store.
//!
//! Both tables use `&str` keys and `&[u8]` values (JSON-serialized types).

use redb::TableDefinition;

/// Job records keyed by job id.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Dedup entries keyed by request fingerprint.
pub const DEDUP: TableDefinition<&str, &[u8]> = TableDefinition::new("dedup");
