//! tidepool-state — embedded state store for Tidepool.
//!
//! Backed by [redb](https://docs.rs/redb), holds job records and the
//! request deduplication index.
//!
//! # Architecture
//!
//! Values are JSON-serialized into redb's `&[u8]` value columns. Jobs are
//! keyed by job id, dedup entries by request fingerprint.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. redb serializes write
//! transactions, which is what makes [`StateStore::lookup_or_create`]
//! exclusive per fingerprint.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{DedupOutcome, PurgeStats, StateStore};
pub use types::*;
