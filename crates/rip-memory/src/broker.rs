use crate::handler::{LowMemoryHandler, ReleaseError};
use crate::pressure::{MemoryPressure, MemoryPressureThresholds};
use crate::report::{MemoryReport, ReclaimReport, ReleasedOffer};
use crate::types::{Offer, ReclaimRequest};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

struct RegistrationEntry {
    name: String,
    usage_bytes: Rc<Cell<u64>>,
    handler: Option<Rc<dyn LowMemoryHandler>>,
}

struct Inner {
    budget_bytes: u64,
    thresholds: MemoryPressureThresholds,
    next_id: Cell<u64>,
    // Keyed by registration id, so iteration order is registration order.
    registrations: RefCell<BTreeMap<u64, RegistrationEntry>>,
    multithreaded: Cell<bool>,
}

/// Central coordinator for low-memory negotiation.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Rc<Inner>,
}

impl MemoryBroker {
    pub fn new(budget_bytes: u64) -> Self {
        Self::with_thresholds(budget_bytes, MemoryPressureThresholds::default())
    }

    pub fn with_thresholds(budget_bytes: u64, thresholds: MemoryPressureThresholds) -> Self {
        Self {
            inner: Rc::new(Inner {
                budget_bytes,
                thresholds,
                next_id: Cell::new(1),
                registrations: RefCell::new(BTreeMap::new()),
                multithreaded: Cell::new(false),
            }),
        }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.inner.budget_bytes
    }

    /// Register a component for memory accounting only.
    pub fn register_tracker(&self, name: impl Into<String>) -> MemoryRegistration {
        self.register_inner(name.into(), None)
    }

    /// Register a handler for accounting and low-memory negotiation.
    pub fn register_handler(&self, handler: Rc<dyn LowMemoryHandler>) -> MemoryRegistration {
        let name = handler.name().to_string();
        self.register_inner(name, Some(handler))
    }

    fn register_inner(
        &self,
        name: String,
        handler: Option<Rc<dyn LowMemoryHandler>>,
    ) -> MemoryRegistration {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        let usage_bytes = Rc::new(Cell::new(0));

        self.inner.registrations.borrow_mut().insert(
            id,
            RegistrationEntry {
                name: name.clone(),
                usage_bytes: usage_bytes.clone(),
                handler,
            },
        );

        MemoryRegistration {
            id,
            name,
            usage_bytes,
            broker: Rc::downgrade(&self.inner),
        }
    }

    /// Mark the start (or end) of a phase in which several threads touch
    /// page memory. Handlers that are not thread safe sit such phases out.
    pub fn set_multithreaded(&self, multithreaded: bool) {
        self.inner.multithreaded.set(multithreaded);
    }

    pub fn is_multithreaded(&self) -> bool {
        self.inner.multithreaded.get()
    }

    /// Number of live registrations, trackers included.
    pub fn registration_count(&self) -> usize {
        self.inner.registrations.borrow().len()
    }

    pub fn pressure(&self) -> MemoryPressure {
        self.pressure_for_total(self.usage_total())
    }

    pub fn report(&self) -> MemoryReport {
        let usage_bytes = self.usage_total();
        MemoryReport {
            budget_bytes: self.inner.budget_bytes,
            usage_bytes,
            pressure: self.pressure_for_total(usage_bytes),
        }
    }

    /// Recompute pressure and, above `Low`, reclaim down to the level's target
    /// share of the budget.
    pub fn enforce(&self) -> Result<ReclaimReport, ReleaseError> {
        let usage = self.usage_total();
        let pressure = self.pressure_for_total(usage);
        let needed = usage.saturating_sub(pressure.target_bytes(self.inner.budget_bytes));
        self.reclaim_at(needed, pressure)
    }

    /// Ask registered handlers for at least `needed` bytes.
    ///
    /// Offers are ranked by cost, then tier, then registration order, and
    /// released until the released offers cover `needed`. A failing release
    /// stops the round and is returned as-is.
    pub fn reclaim(&self, needed: u64) -> Result<ReclaimReport, ReleaseError> {
        self.reclaim_at(needed, self.pressure())
    }

    fn reclaim_at(
        &self,
        needed: u64,
        pressure: MemoryPressure,
    ) -> Result<ReclaimReport, ReleaseError> {
        let mut report = ReclaimReport {
            requested: needed,
            ..ReclaimReport::default()
        };
        if needed == 0 {
            return Ok(report);
        }

        // Snapshot the handlers so we don't hold the registration borrow while
        // calling out; a handler may register or drop registrations itself.
        let handlers: Vec<(u64, Rc<dyn LowMemoryHandler>)> = {
            let registrations = self.inner.registrations.borrow();
            registrations
                .iter()
                .filter_map(|(&id, entry)| entry.handler.clone().map(|handler| (id, handler)))
                .collect()
        };

        let request = ReclaimRequest { needed, pressure };
        let multithreaded = self.inner.multithreaded.get();
        let mut offers: Vec<(u64, Rc<dyn LowMemoryHandler>, Offer)> = Vec::new();
        for (id, handler) in handlers {
            if multithreaded && !handler.thread_safe() {
                report.skipped_thread_unsafe += 1;
                continue;
            }
            let Some(offer) = handler.solicit(&request) else {
                continue;
            };
            if offer.size == 0 {
                continue;
            }
            report.offered = report.offered.saturating_add(offer.size);
            offers.push((id, handler, offer));
        }

        offers.sort_by(|(a_id, a_handler, a), (b_id, b_handler, b)| {
            a.cost
                .total_cmp(&b.cost)
                .then_with(|| a_handler.tier().cmp(&b_handler.tier()))
                .then_with(|| a_id.cmp(b_id))
        });

        let mut covered = 0u64;
        for (_id, handler, offer) in offers {
            if covered >= needed {
                break;
            }
            let committed = handler.release(&offer)?;
            tracing::debug!(
                target: "rip.memory",
                handler = handler.name(),
                pool = %offer.pool,
                size = offer.size,
                cost = offer.cost,
                committed,
                "released low-memory offer"
            );
            if committed {
                covered = covered.saturating_add(offer.size);
                report.released.push(ReleasedOffer {
                    handler: handler.name().to_string(),
                    offer,
                });
            }
        }

        Ok(report)
    }

    fn pressure_for_total(&self, usage_total: u64) -> MemoryPressure {
        self.inner
            .thresholds
            .level_for_usage(usage_total, self.inner.budget_bytes)
    }

    fn usage_total(&self) -> u64 {
        self.inner
            .registrations
            .borrow()
            .values()
            .fold(0u64, |acc, entry| acc.saturating_add(entry.usage_bytes.get()))
    }
}

/// Handle kept by the registering component; dropping it unregisters the
/// component and removes its contribution from memory accounting.
pub struct MemoryRegistration {
    id: u64,
    name: String,
    usage_bytes: Rc<Cell<u64>>,
    broker: Weak<Inner>,
}

impl MemoryRegistration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracker(&self) -> MemoryTracker {
        MemoryTracker {
            usage_bytes: self.usage_bytes.clone(),
        }
    }
}

impl std::fmt::Debug for MemoryRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegistration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("usage_bytes", &self.usage_bytes.get())
            .finish()
    }
}

impl Drop for MemoryRegistration {
    fn drop(&mut self) {
        self.usage_bytes.set(0);
        if let Some(broker) = self.broker.upgrade() {
            broker.registrations.borrow_mut().remove(&self.id);
        }
    }
}

/// Lightweight per-component memory accounting handle.
#[derive(Clone)]
pub struct MemoryTracker {
    usage_bytes: Rc<Cell<u64>>,
}

impl MemoryTracker {
    pub fn set_bytes(&self, bytes: u64) {
        self.usage_bytes.set(bytes);
    }

    pub fn add_bytes(&self, delta: i64) {
        let current = self.usage_bytes.get();
        let next = if delta >= 0 {
            current.saturating_add(delta as u64)
        } else {
            current.saturating_sub(delta.unsigned_abs())
        };
        self.usage_bytes.set(next);
    }

    pub fn bytes(&self) -> u64 {
        self.usage_bytes.get()
    }
}

impl std::fmt::Debug for MemoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTracker")
            .field("bytes", &self.bytes())
            .finish()
    }
}
