//! `reverie-insight` – The Pattern Reader.
//!
//! Turns one user's memory stream and cluster snapshots into recurring
//! [`Pattern`][reverie_types::Pattern]s and confidence-scored
//! [`Prediction`][reverie_types::Prediction]s.  Everything here is pure and
//! synchronous; the runtime decides when a sweep runs.
//!
//! # Modules
//!
//! - [`detector`] – the [`Detector`][detector::Detector] trait, the
//!   [`DetectionInput`][detector::DetectionInput] handed to it, and the
//!   [`PatternDetector`][detector::PatternDetector] registry.
//! - [`detectors`] – emotional cycles, breakthrough moments, recurring
//!   challenges and growth accelerators.
//! - [`prediction`] – [`PredictionGenerator`][prediction::PredictionGenerator].
//! - [`config`] – [`InsightConfig`][config::InsightConfig] thresholds.

pub mod config;
pub mod detector;
pub mod detectors;
pub mod prediction;

pub use config::InsightConfig;
pub use detector::{DetectionInput, Detector, PatternDetector};
pub use prediction::{PredictionGenerator, confidence_cap};
