//! `reverie-memory` – The System of Record.
//!
//! Persists memories and cluster records to a local SQLite substrate.
//!
//! # Modules
//!
//! - [`store`] – [`MemoryStore`][store::MemoryStore]: the append-only,
//!   per-user memory log.  Appends are idempotent by memory id, and
//!   [`stream_since`][store::MemoryStore::stream_since] yields a lazy,
//!   restartable, timestamp-ordered [`MemoryStream`][store::MemoryStream].
//! - [`cluster_table`] – persistence of
//!   [`MemoryCluster`][reverie_types::MemoryCluster] rows keyed by id with a
//!   per-user index, so the clustering engine can be restored after a
//!   restart.

pub mod cluster_table;
pub mod store;

pub use store::{AppendOutcome, MemoryStore, MemoryStream, StoreError};
