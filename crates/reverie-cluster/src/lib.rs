//! `reverie-cluster` – The Semantic Grouper.
//!
//! Incrementally groups one user's memories into semantic clusters and keeps
//! each cluster's derived fields current.
//!
//! # Modules
//!
//! - [`engine`] – [`UserClusters`][engine::UserClusters]: assignment with a
//!   similarity threshold, the Forming → Active → Dormant → Pruned lifecycle,
//!   merge pass, restore from persisted rows and self-healing of the running
//!   mean invariant.
//! - [`derive`] – pure functions for emotional context, phase context,
//!   strength score and strength trend.
//! - [`concepts`] – deterministic keyword extraction from member text.
//! - [`similarity`] – cosine similarity and running-mean helpers.

pub mod concepts;
pub mod derive;
pub mod engine;
pub mod similarity;

pub use engine::{AssignOutcome, Assignment, ClusterConfig, MergeEvent, TickReport, UserClusters};
