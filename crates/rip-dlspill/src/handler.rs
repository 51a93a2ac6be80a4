use std::cell::RefCell;
use std::rc::Rc;

use rip_memory::{
    LowMemoryHandler, MemoryBroker, MemoryRegistration, MemoryTier, Offer, ReclaimRequest,
    ReleaseError,
};

use crate::container::PurgeLevel;
use crate::store::DisplayListStore;

/// Low-memory handler fronting one purge phase of a [`DisplayListStore`].
///
/// Purging walks page structures the interpreter mutates without locks, so
/// the handler is not thread safe and the broker skips it while rendering
/// threads are running.
pub struct PurgeHandler {
    level: PurgeLevel,
    store: Rc<RefCell<DisplayListStore>>,
}

impl PurgeHandler {
    pub fn new(level: PurgeLevel, store: Rc<RefCell<DisplayListStore>>) -> Self {
        Self { level, store }
    }

    pub fn level(&self) -> PurgeLevel {
        self.level
    }
}

impl LowMemoryHandler for PurgeHandler {
    fn name(&self) -> &str {
        match self.level {
            PurgeLevel::Aggregated => "dl-purge-headers",
            PurgeLevel::Payloads | PurgeLevel::None => "dl-purge-payloads",
        }
    }

    fn tier(&self) -> MemoryTier {
        MemoryTier::DisplayList
    }

    fn solicit(&self, _request: &ReclaimRequest) -> Option<Offer> {
        // A store that is already borrowed is mid-operation; nothing to offer.
        self.store.try_borrow().ok()?.solicit_offer(self.level)
    }

    fn release(&self, _offer: &Offer) -> Result<bool, ReleaseError> {
        let Ok(mut store) = self.store.try_borrow_mut() else {
            return Ok(false);
        };
        let report = store
            .purge_page(self.level)
            .map_err(|err| ReleaseError::new(self.name(), err))?;
        Ok(report.bytes_reclaimed > 0 || report.chains_purged > 0)
    }
}

/// Registers both purge phases of `store` with `broker`.
///
/// The handlers stay registered for as long as the returned registrations
/// are alive.
pub fn register_purge_handlers(
    broker: &MemoryBroker,
    store: &Rc<RefCell<DisplayListStore>>,
) -> [MemoryRegistration; 2] {
    [PurgeLevel::Payloads, PurgeLevel::Aggregated].map(|level| {
        broker.register_handler(Rc::new(PurgeHandler::new(level, Rc::clone(store))))
    })
}
