//! Shared data model and on-disk contracts for batch image generation.

pub mod batches;
pub mod console;
pub mod events;
pub mod naming;
pub mod runs;
pub mod tiers;
