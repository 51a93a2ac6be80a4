use rip_memory::{
    LowMemoryHandler, MemoryBroker, MemoryPressure, MemoryRegistration, MemoryTier, Offer,
    MemoryTracker, ReclaimRequest, ReleaseError,
};
use std::cell::{Cell, OnceCell, RefCell};
use std::rc::Rc;

struct TestHandler {
    name: String,
    tier: MemoryTier,
    cost: f32,
    thread_safe: bool,
    fail: bool,
    bytes: Cell<u64>,
    solicits: Cell<usize>,
    releases: Cell<usize>,
    log: Rc<RefCell<Vec<String>>>,
    tracker: OnceCell<MemoryTracker>,
}

impl TestHandler {
    fn new(
        broker: &MemoryBroker,
        name: &str,
        tier: MemoryTier,
        cost: f32,
        log: &Rc<RefCell<Vec<String>>>,
    ) -> (Rc<Self>, MemoryRegistration) {
        Self::build(broker, name, tier, cost, false, false, log)
    }

    fn build(
        broker: &MemoryBroker,
        name: &str,
        tier: MemoryTier,
        cost: f32,
        thread_safe: bool,
        fail: bool,
        log: &Rc<RefCell<Vec<String>>>,
    ) -> (Rc<Self>, MemoryRegistration) {
        let handler = Rc::new(Self {
            name: name.to_string(),
            tier,
            cost,
            thread_safe,
            fail,
            bytes: Cell::new(0),
            solicits: Cell::new(0),
            releases: Cell::new(0),
            log: log.clone(),
            tracker: OnceCell::new(),
        });
        let registration = broker.register_handler(handler.clone());
        handler
            .tracker
            .set(registration.tracker())
            .unwrap_or_else(|_| panic!("tracker only set once"));
        (handler, registration)
    }

    fn set_bytes(&self, bytes: u64) {
        self.bytes.set(bytes);
        self.tracker.get().unwrap().set_bytes(bytes);
    }
}

impl LowMemoryHandler for TestHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> MemoryTier {
        self.tier
    }

    fn thread_safe(&self) -> bool {
        self.thread_safe
    }

    fn solicit(&self, _request: &ReclaimRequest) -> Option<Offer> {
        self.solicits.set(self.solicits.get() + 1);
        let bytes = self.bytes.get();
        (bytes > 0).then(|| Offer {
            pool: self.name.clone(),
            size: bytes,
            cost: self.cost,
        })
    }

    fn release(&self, offer: &Offer) -> Result<bool, ReleaseError> {
        self.releases.set(self.releases.get() + 1);
        self.log.borrow_mut().push(self.name.clone());
        if self.fail {
            return Err(ReleaseError::new(
                self.name.clone(),
                std::io::Error::other("disk full"),
            ));
        }
        let remaining = self.bytes.get().saturating_sub(offer.size);
        self.set_bytes(remaining);
        Ok(true)
    }
}

#[test]
fn releases_cheapest_offers_until_request_is_covered() {
    let broker = MemoryBroker::new(1_000);
    let log = Rc::new(RefCell::new(Vec::new()));

    let (expensive, _expensive_registration) =
        TestHandler::new(&broker, "expensive", MemoryTier::Cache, 10.0, &log);
    let (cheap, _cheap_registration) =
        TestHandler::new(&broker, "cheap", MemoryTier::Cache, 1.0, &log);
    let (middle, _middle_registration) =
        TestHandler::new(&broker, "middle", MemoryTier::Cache, 5.0, &log);
    expensive.set_bytes(100);
    cheap.set_bytes(100);
    middle.set_bytes(100);

    let report = broker.reclaim(150).unwrap();

    assert_eq!(*log.borrow(), vec!["cheap".to_string(), "middle".to_string()]);
    assert_eq!(report.offered, 300);
    assert_eq!(report.released_bytes(), 200);
    assert_eq!(expensive.releases.get(), 0);
    assert_eq!(expensive.solicits.get(), 1);
}

#[test]
fn equal_cost_offers_are_ranked_by_tier() {
    let broker = MemoryBroker::new(1_000);
    let log = Rc::new(RefCell::new(Vec::new()));

    let (reserve, _reserve_registration) =
        TestHandler::new(&broker, "reserve", MemoryTier::Reserve, 1.0, &log);
    let (dl, _dl_registration) =
        TestHandler::new(&broker, "dl", MemoryTier::DisplayList, 1.0, &log);
    let (cache, _cache_registration) =
        TestHandler::new(&broker, "cache", MemoryTier::Cache, 1.0, &log);
    reserve.set_bytes(10);
    dl.set_bytes(10);
    cache.set_bytes(10);

    broker.reclaim(30).unwrap();

    assert_eq!(
        *log.borrow(),
        vec!["cache".to_string(), "dl".to_string(), "reserve".to_string()]
    );
}

#[test]
fn multithreaded_phase_skips_thread_unsafe_handlers() {
    let broker = MemoryBroker::new(1_000);
    let log = Rc::new(RefCell::new(Vec::new()));

    let (unsafe_handler, _unsafe_handler_registration) =
        TestHandler::new(&broker, "dl", MemoryTier::DisplayList, 1.0, &log);
    let (safe_handler, _safe_handler_registration) = TestHandler::build(
        &broker,
        "fonts",
        MemoryTier::Cache,
        5.0,
        true,
        false,
        &log,
    );
    unsafe_handler.set_bytes(50);
    safe_handler.set_bytes(50);

    broker.set_multithreaded(true);
    let report = broker.reclaim(100).unwrap();
    assert_eq!(report.skipped_thread_unsafe, 1);
    assert_eq!(unsafe_handler.solicits.get(), 0);
    assert_eq!(*log.borrow(), vec!["fonts".to_string()]);

    broker.set_multithreaded(false);
    broker.reclaim(50).unwrap();
    assert_eq!(unsafe_handler.releases.get(), 1);
}

#[test]
fn failing_release_stops_the_round() {
    let broker = MemoryBroker::new(1_000);
    let log = Rc::new(RefCell::new(Vec::new()));

    let (failing, _failing_registration) = TestHandler::build(
        &broker,
        "failing",
        MemoryTier::Cache,
        1.0,
        false,
        true,
        &log,
    );
    let (other, _other_registration) =
        TestHandler::new(&broker, "other", MemoryTier::Cache, 2.0, &log);
    failing.set_bytes(10);
    other.set_bytes(10);

    let err = broker.reclaim(20).unwrap_err();
    assert_eq!(err.handler, "failing");
    assert_eq!(other.releases.get(), 0);
}

#[test]
fn dropping_registration_unregisters_handler() {
    let broker = MemoryBroker::new(1_000);
    let log = Rc::new(RefCell::new(Vec::new()));

    let (handler, registration) =
        TestHandler::new(&broker, "dl", MemoryTier::DisplayList, 1.0, &log);
    handler.set_bytes(500);
    assert_eq!(broker.registration_count(), 1);
    assert_eq!(broker.report().usage_bytes, 500);
    assert_eq!(Rc::strong_count(&handler), 2);

    drop(registration);

    assert_eq!(broker.registration_count(), 0);
    assert_eq!(broker.report().usage_bytes, 0);
    assert_eq!(Rc::strong_count(&handler), 1);
    assert_eq!(broker.reclaim(100).unwrap().offered, 0);
}

#[test]
fn enforce_reclaims_down_to_pressure_target() {
    let broker = MemoryBroker::new(1_000);
    let log = Rc::new(RefCell::new(Vec::new()));

    let (handler, _handler_registration) =
        TestHandler::new(&broker, "dl", MemoryTier::DisplayList, 1.0, &log);
    handler.set_bytes(900);
    assert_eq!(broker.pressure(), MemoryPressure::High);

    let report = broker.enforce().unwrap();

    // High pressure targets half of the budget.
    assert_eq!(report.requested, 400);
    assert_eq!(report.released.len(), 1);
    assert_eq!(broker.pressure(), MemoryPressure::Low);
}

#[test]
fn enforce_under_low_pressure_is_a_no_op() {
    let broker = MemoryBroker::new(1_000);
    let log = Rc::new(RefCell::new(Vec::new()));

    let (handler, _handler_registration) =
        TestHandler::new(&broker, "dl", MemoryTier::DisplayList, 1.0, &log);
    handler.set_bytes(100);

    let report = broker.enforce().unwrap();
    assert_eq!(report.requested, 0);
    assert_eq!(handler.solicits.get(), 0);
}

#[test]
fn report_serializes_to_json() {
    let broker = MemoryBroker::new(1_000);
    let tracker = broker.register_tracker("fonts");
    tracker.tracker().set_bytes(750);

    let json = serde_json::to_value(broker.report()).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "budget_bytes": 1000,
            "usage_bytes": 750,
            "pressure": "medium",
        })
    );
}
