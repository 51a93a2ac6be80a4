use thiserror::Error;

use crate::types::{MemoryTier, Offer, ReclaimRequest};

/// A subsystem that can hand memory back to the broker on request.
///
/// `solicit` must not change anything the handler would later rely on; the
/// broker may solicit without ever releasing. `release` is only called with an
/// offer previously returned by `solicit` in the same round.
pub trait LowMemoryHandler {
    fn name(&self) -> &str;

    fn tier(&self) -> MemoryTier;

    /// Whether the handler may run while other threads touch the memory it
    /// manages. Handlers that return `false` are skipped during multi-threaded
    /// phases.
    fn thread_safe(&self) -> bool {
        false
    }

    fn solicit(&self, request: &ReclaimRequest) -> Option<Offer>;

    /// Reclaim the accepted offer. `Ok(false)` means nothing was committed.
    fn release(&self, offer: &Offer) -> Result<bool, ReleaseError>;
}

/// A handler could not complete its release step.
///
/// The broker stops the round and hands this back to whoever asked for memory;
/// the handler's own state is whatever the handler left it in.
#[derive(Debug, Error)]
#[error("low-memory handler `{handler}` failed to release its offer")]
pub struct ReleaseError {
    pub handler: String,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl ReleaseError {
    pub fn new(
        handler: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            handler: handler.into(),
            source: source.into(),
        }
    }
}
