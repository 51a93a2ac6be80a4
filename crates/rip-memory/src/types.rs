use serde::{Deserialize, Serialize};

use crate::pressure::MemoryPressure;

/// Ranking band for offers from unrelated subsystems.
///
/// When two offers cost the same, the one from the lower tier is released
/// first: caches are cheaper to rebuild than display-list data, and reserves
/// are the last resort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Cache,
    DisplayList,
    Reserve,
}

/// What a handler says it could give back if asked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Memory pool the bytes would be returned to.
    pub pool: String,
    /// Estimated number of bytes reclaimable.
    pub size: u64,
    /// Relative cost of reclaiming; lower is released first.
    pub cost: f32,
}

/// Parameters of one solicitation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimRequest {
    pub needed: u64,
    pub pressure: MemoryPressure,
}
