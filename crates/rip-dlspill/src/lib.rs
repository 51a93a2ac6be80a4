//! Display-list eviction for the RIP.
//!
//! A page's display list is a set of chains of containers, each container
//! holding either one resident [`DisplayObject`] or a run of objects packed
//! into an aggregate record on a scratch channel. When the memory broker runs
//! short, [`DisplayListStore`] frees memory in two phases:
//!
//! 1. bulky payloads (fill and Gouraud meshes) are spilled to disk, leaving
//!    the object headers resident;
//! 2. runs of interior containers are packed into aggregate records and their
//!    nodes released.
//!
//! Each chain carries a watermark recording how far it has been purged, so
//! repeated requests skip work already done. Spilled data is brought back on
//! demand through a single load buffer (payloads) and a one-slot write-back
//! block cache (aggregates).
//!
//! The store belongs to the interpreter thread. It is neither `Send` nor
//! `Sync`, and its [`PurgeHandler`]s report themselves as not thread safe so
//! the broker leaves them alone during multi-threaded rendering.

mod block_cache;
mod channel;
mod config;
mod container;
mod error;
mod handler;
mod load_buffer;
mod object;
mod pool;
mod purge;
mod record;
mod store;

pub use block_cache::BlockCacheStats;
pub use channel::{ChannelFactory, DiskChannel, FileChannel, MemoryChannel};
pub use config::{ByteSize, SpillConfig};
pub use container::{ChainId, ContainerId, ContainerInfo, PurgeLevel};
pub use error::{Result, SpillError};
pub use handler::{register_purge_handlers, PurgeHandler};
pub use object::{
    ArchivedPayload, BBox, DisplayObject, FillMesh, FillThread, GouraudMesh, GouraudVertex,
    ObjectFlags, ObjectHeader, Opcode, Payload, PayloadSlot, PayloadView, Point,
};
pub use pool::{NodePool, PoolMode};
pub use purge::DISPLAY_LIST_POOL;
pub use record::{RecordHeader, RecordKind, RECORD_HEADER_LEN};
pub use store::{DisplayListStore, OutputMode, PageOptions, PurgeReport, SpillStats};
