//! Low-memory negotiation between the RIP's memory broker and the subsystems
//! that can give memory back.
//!
//! The protocol is two-step:
//! - the broker *solicits* every registered [`LowMemoryHandler`] for an
//!   [`Offer`] (an estimate of reclaimable bytes plus a ranking cost);
//! - the cheapest offers are then *released*, in order, until the request is
//!   covered.
//!
//! Everything here is single-threaded. The broker, its registrations and its
//! trackers are `Rc`-based, so none of them can cross a thread boundary. Handlers
//! that are not thread safe are additionally skipped while the broker is marked
//! as running a multi-threaded phase (see [`MemoryBroker::set_multithreaded`]).

mod broker;
mod handler;
mod pressure;
mod report;
mod size;
mod types;

pub use broker::{MemoryBroker, MemoryRegistration, MemoryTracker};
pub use handler::{LowMemoryHandler, ReleaseError};
pub use pressure::{MemoryPressure, MemoryPressureThresholds};
pub use report::{MemoryReport, ReclaimReport, ReleasedOffer};
pub use size::{parse_byte_size, ParseByteSizeError, GB, KB, MB};
pub use types::{MemoryTier, Offer, ReclaimRequest};
