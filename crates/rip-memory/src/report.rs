use crate::pressure::MemoryPressure;
use crate::types::Offer;
use serde::{Deserialize, Serialize};

/// Snapshot of tracked memory state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReport {
    pub budget_bytes: u64,
    pub usage_bytes: u64,
    pub pressure: MemoryPressure,
}

/// An offer the broker accepted and the handler committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasedOffer {
    pub handler: String,
    pub offer: Offer,
}

/// Outcome of one [`crate::MemoryBroker::reclaim`] round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub requested: u64,
    /// Sum of every offer made, accepted or not.
    pub offered: u64,
    pub released: Vec<ReleasedOffer>,
    /// Handlers left out because the broker was in a multi-threaded phase.
    pub skipped_thread_unsafe: usize,
}

impl ReclaimReport {
    pub fn released_bytes(&self) -> u64 {
        self.released
            .iter()
            .fold(0u64, |acc, released| acc.saturating_add(released.offer.size))
    }
}
