//! `reverie-types` – shared vocabulary of the Reverie workspace.
//!
//! Every other crate depends on this one.  It holds the explicit, tagged
//! records that flow through the engine and the wire shapes of the two read
//! contracts.
//!
//! # Modules
//!
//! - [`memory`] – [`Memory`], the atomic reflective record, plus the
//!   [`RawMemory`] shape accepted before enrichment.
//! - [`cluster`] – [`MemoryCluster`], its [`ClusterState`] lifecycle and the
//!   read-only [`ClusterSnapshot`] handed to detectors and queries.
//! - [`insight`] – [`Pattern`], [`Prediction`], [`PatternType`] and
//!   [`Timeframe`].
//! - [`query`] – request/response records of the pattern and cluster queries.
//! - [`error`] – [`ReverieError`], the error taxonomy shared by all crates.

pub mod cluster;
pub mod error;
pub mod insight;
pub mod memory;
pub mod query;

pub use cluster::{ClusterSnapshot, ClusterState, MemoryCluster};
pub use error::ReverieError;
pub use insight::{Pattern, PatternType, Prediction, Timeframe};
pub use memory::{Memory, PhaseTag, RawMemory, SourceType};
pub use query::{
    ClusterQuery, ClusterQueryResponse, ClusterSummary, PatternQuery, PatternQueryResponse,
    PatternSummary, PredictionSummary,
};
