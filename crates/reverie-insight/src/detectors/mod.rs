//! Built-in [`Detector`][crate::detector::Detector] implementations, one per
//! [`PatternType`][reverie_types::PatternType].

pub mod breakthroughs;
pub mod emotional_cycles;
pub mod growth_accelerators;
pub mod recurring_challenges;

pub use breakthroughs::BreakthroughDetector;
pub use emotional_cycles::EmotionalCycleDetector;
pub use growth_accelerators::GrowthAcceleratorDetector;
pub use recurring_challenges::RecurringChallengeDetector;
