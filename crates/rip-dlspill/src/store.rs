use std::io;
use std::marker::PhantomData;
use std::rc::Rc;

use rip_memory::MemoryTracker;
use serde::{Deserialize, Serialize};

use crate::block_cache::{BlockCache, BlockCacheStats};
use crate::channel::{ChannelFactory, DiskChannel, FileChannel, SpillFile};
use crate::config::SpillConfig;
use crate::container::{
    Chain, ChainId, Container, ContainerArena, ContainerId, ContainerInfo, ContainerState,
    PurgeLevel,
};
use crate::error::{Result, SpillError};
use crate::load_buffer::LoadBuffer;
use crate::object::{
    ArchivedPayload, DisplayObject, GouraudMesh, ObjectHeader, Payload, PayloadSlot, PayloadView,
};
use crate::pool::NodePool;
use crate::record::{encode_body, RecordKind, RECORD_HEADER_LEN};

/// How the page will be consumed once it is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Bands are rendered in order; spilled data is read back at most a few
    /// times.
    #[default]
    Sequential,
    /// Objects are revisited unpredictably, so spilling would thrash.
    RandomAccess,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageOptions {
    pub output: OutputMode,
}

/// Per-page spill counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpillStats {
    /// Bytes written to the scratch channel, record headers included.
    pub bytes_archived: u64,
    /// Resident bytes given back by purge passes.
    pub bytes_reclaimed: u64,
    pub payloads_archived: u64,
    pub objects_aggregated: u64,
    pub aggregates_written: u64,
    pub largest_record: u64,
    pub pool_underflows: u64,
    /// Payloads left resident because their record would not fit the load
    /// buffer.
    pub oversize_skips: u64,
    /// Bytes held by containers, objects and resident payloads.
    pub resident_bytes: u64,
    pub block_cache: BlockCacheStats,
}

/// Outcome of [`DisplayListStore::purge_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub level: PurgeLevel,
    pub chains_purged: usize,
    pub bytes_reclaimed: u64,
}

#[derive(Debug)]
pub(crate) struct PageState {
    pub(crate) purging_enabled: bool,
    pub(crate) failed: bool,
    pub(crate) purging: bool,
    pub(crate) arena: ContainerArena,
    pub(crate) chains: Vec<Chain>,
    pub(crate) pool: NodePool,
    pub(crate) block_cache: BlockCache,
    pub(crate) stats: SpillStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Location {
    Resident(ContainerId),
    Packed {
        container: ContainerId,
        offset: u64,
        count: u32,
        slot: usize,
    },
}

enum Rewrite {
    Spilled(ArchivedPayload),
    InChain(ContainerId),
    InBlock(ContainerId, usize, DisplayObject),
}

impl PageState {
    fn new(purging_enabled: bool, pool_capacity: usize) -> Self {
        Self {
            purging_enabled,
            failed: false,
            purging: false,
            arena: ContainerArena::default(),
            chains: Vec::new(),
            pool: NodePool::new(pool_capacity),
            block_cache: BlockCache::default(),
            stats: SpillStats::default(),
        }
    }

    pub(crate) fn chain(&self, id: ChainId) -> Result<&Chain> {
        self.chains
            .get(id.to_raw() as usize)
            .ok_or(SpillError::UnknownChain(id))
    }

    pub(crate) fn chain_mut(&mut self, id: ChainId) -> Result<&mut Chain> {
        self.chains
            .get_mut(id.to_raw() as usize)
            .ok_or(SpillError::UnknownChain(id))
    }

    pub(crate) fn container(&self, id: ContainerId) -> Result<&Container> {
        self.arena.get(id).ok_or(SpillError::BrokenChain(id))
    }

    /// Walks the chain to the container holding its `index`th object.
    fn locate(&self, chain: ChainId, index: usize) -> Result<Location> {
        let state = self.chain(chain)?;
        let out_of_range = SpillError::ObjectOutOfRange {
            index,
            len: state.objects,
        };
        if index >= state.objects {
            return Err(out_of_range);
        }

        let mut remaining = index;
        let mut cursor = state.head;
        while let Some(id) = cursor {
            let container = self.container(id)?;
            let count = container.object_count();
            if remaining < count {
                return Ok(match container.state {
                    ContainerState::Resident(_) => Location::Resident(id),
                    ContainerState::Archived { offset, count } => Location::Packed {
                        container: id,
                        offset,
                        count,
                        slot: remaining,
                    },
                });
            }
            remaining -= count;
            cursor = container.next;
        }
        Err(out_of_range)
    }

    /// The object at an already staged location.
    fn object_at(&self, location: Location) -> Result<&DisplayObject> {
        match location {
            Location::Resident(id) => match &self.container(id)?.state {
                ContainerState::Resident(object) => Ok(&**object),
                ContainerState::Archived { .. } => Err(SpillError::BrokenChain(id)),
            },
            Location::Packed {
                container, slot, ..
            } => self
                .block_cache
                .object(container, slot)
                .ok_or(SpillError::BlockNotLoaded(container)),
        }
    }
}

pub(crate) fn live(page: &mut Option<PageState>) -> Result<&mut PageState> {
    match page {
        None => Err(SpillError::NoActivePage),
        Some(page) if page.failed => Err(SpillError::PageFailed),
        Some(page) => Ok(page),
    }
}

fn live_ref(page: &Option<PageState>) -> Result<&PageState> {
    match page {
        None => Err(SpillError::NoActivePage),
        Some(page) if page.failed => Err(SpillError::PageFailed),
        Some(page) => Ok(page),
    }
}

/// Spills the bulky payload of `object`, returning the resident bytes freed.
///
/// A payload whose record would not fit the load buffer stays resident and
/// frees nothing.
pub(crate) fn archive_object_payload(
    object: &mut DisplayObject,
    file: &mut SpillFile,
    load_buffer: &mut LoadBuffer,
    stats: &mut SpillStats,
) -> Result<u64> {
    let (kind, body, freed) = match &object.payload {
        Payload::Fill(PayloadSlot::Resident(mesh)) => (
            RecordKind::FillPayload,
            encode_body(&**mesh)?,
            mesh.resident_bytes(),
        ),
        Payload::Gouraud(PayloadSlot::Resident(mesh)) => (
            RecordKind::GouraudPayload,
            encode_body(&**mesh)?,
            mesh.resident_bytes(),
        ),
        _ => return Ok(0),
    };

    let record_len = RECORD_HEADER_LEN + body.len();
    let len = match u32::try_from(body.len()) {
        Ok(len) if load_buffer.reserve(record_len) => len,
        _ => {
            stats.oversize_skips += 1;
            tracing::trace!(
                target: "rip.dlspill",
                record_len,
                limit = load_buffer.limit(),
                "payload does not fit the load buffer; left resident"
            );
            return Ok(0);
        }
    };

    let offset = file.append(kind, 1, &body)?;
    let archived = ArchivedPayload { offset, len };
    match &mut object.payload {
        Payload::Fill(slot) => *slot = PayloadSlot::Archived(archived),
        Payload::Gouraud(slot) => *slot = PayloadSlot::Archived(archived),
        Payload::None | Payload::Glyphs { .. } => {}
    }

    stats.payloads_archived += 1;
    stats.bytes_archived += record_len as u64;
    stats.largest_record = stats.largest_record.max(record_len as u64);
    stats.bytes_reclaimed += freed;
    stats.resident_bytes = stats.resident_bytes.saturating_sub(freed);
    Ok(freed)
}

fn spilled_payload(object: &DisplayObject) -> Option<(ArchivedPayload, RecordKind)> {
    match &object.payload {
        Payload::Fill(PayloadSlot::Archived(archived)) => {
            Some((*archived, RecordKind::FillPayload))
        }
        Payload::Gouraud(PayloadSlot::Archived(archived)) => {
            Some((*archived, RecordKind::GouraudPayload))
        }
        _ => None,
    }
}

fn resident_view(object: &DisplayObject) -> PayloadView<'_> {
    match &object.payload {
        Payload::None => PayloadView::None,
        Payload::Glyphs { glyph_ids } => PayloadView::Glyphs(glyph_ids),
        Payload::Fill(PayloadSlot::Resident(mesh)) => PayloadView::Fill(mesh),
        Payload::Gouraud(PayloadSlot::Resident(mesh)) => PayloadView::Gouraud(mesh),
        Payload::Fill(PayloadSlot::Archived(_)) | Payload::Gouraud(PayloadSlot::Archived(_)) => {
            PayloadView::None
        }
    }
}

/// The display-list store of one interpreter.
///
/// Owns the current page's chains, its scratch channel and the buffers used
/// to bring spilled data back. Everything here runs on the interpreter
/// thread; the type is neither `Send` nor `Sync`.
pub struct DisplayListStore {
    pub(crate) config: SpillConfig,
    pub(crate) file: SpillFile,
    pub(crate) load_buffer: LoadBuffer,
    pub(crate) page: Option<PageState>,
    tracker: Option<MemoryTracker>,
    _not_send: PhantomData<Rc<()>>,
}

impl DisplayListStore {
    /// A store spilling to anonymous files in `config.scratch_dir` (or the
    /// system temp dir).
    pub fn new(config: SpillConfig) -> Self {
        let dir = config.scratch_dir.clone();
        Self::with_channel_factory(
            config,
            Box::new(move || -> io::Result<Box<dyn DiskChannel>> {
                let channel = FileChannel::create(dir.as_deref())?;
                Ok(Box::new(channel) as Box<dyn DiskChannel>)
            }),
        )
    }

    pub fn with_channel_factory(config: SpillConfig, open: ChannelFactory) -> Self {
        let load_buffer = LoadBuffer::new(config.load_buffer_limit_bytes());
        Self {
            config,
            file: SpillFile::new(open),
            load_buffer,
            page: None,
            tracker: None,
            _not_send: PhantomData,
        }
    }

    pub fn config(&self) -> &SpillConfig {
        &self.config
    }

    /// Reports the page's resident bytes to a broker tracker from now on.
    pub fn attach_tracker(&mut self, tracker: MemoryTracker) {
        self.tracker = Some(tracker);
        self.report_usage();
    }

    /// Starts a new page, tearing down whatever the previous one left behind.
    pub fn notify_page_reset(&mut self, options: PageOptions) {
        if let Err(err) = self.end_page() {
            tracing::warn!(
                target: "rip.dlspill",
                error = %err,
                "failed to tear down previous display-list page"
            );
        }

        let purging_enabled = self.config.enabled && options.output == OutputMode::Sequential;
        if self.config.enabled && !purging_enabled {
            tracing::debug!(
                target: "rip.dlspill",
                output = ?options.output,
                "display-list purging disabled for this page"
            );
        }
        self.page = Some(PageState::new(
            purging_enabled,
            self.config.node_pool_capacity,
        ));
        self.report_usage();
    }

    /// Finishes the page: writes back the block cache, closes the scratch
    /// channel and drops every container.
    pub fn end_page(&mut self) -> Result<()> {
        let Some(mut page) = self.page.take() else {
            return Ok(());
        };
        let flushed = if page.failed {
            page.block_cache.discard();
            Ok(())
        } else {
            page.block_cache.flush(&mut self.file)
        };
        self.load_buffer.clear();
        let closed = self.file.close();
        self.report_usage();
        tracing::debug!(
            target: "rip.dlspill",
            chains = page.chains.len(),
            bytes_archived = page.stats.bytes_archived,
            failed = page.failed,
            "display-list page ended"
        );
        flushed.and(closed)
    }

    pub fn has_page(&self) -> bool {
        self.page.is_some()
    }

    pub fn is_page_failed(&self) -> bool {
        self.page.as_ref().is_some_and(|page| page.failed)
    }

    /// Turns purging off for the rest of the current page.
    pub fn disable_for_page(&mut self) {
        if let Some(page) = self.page.as_mut() {
            page.purging_enabled = false;
        }
    }

    pub fn is_purging_enabled(&self) -> bool {
        self.page
            .as_ref()
            .is_some_and(|page| page.purging_enabled && !page.failed)
    }

    pub fn create_chain(&mut self) -> Result<ChainId> {
        let page = live(&mut self.page)?;
        let id = ChainId::from_raw(page.chains.len() as u32);
        page.chains.push(Chain::default());
        Ok(id)
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.page
            .as_ref()
            .map(|page| {
                (0..page.chains.len() as u32)
                    .map(ChainId::from_raw)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Appends an object to the end of `chain`.
    ///
    /// New resident data means the chain is no longer purged to any level, so
    /// its watermark drops back to [`PurgeLevel::None`].
    pub fn append(&mut self, chain: ChainId, object: DisplayObject) -> Result<()> {
        let page = live(&mut self.page)?;
        page.chain(chain)?;

        let container = Container::resident(object);
        let bytes = container.resident_bytes();
        let id = page.arena.alloc(container);
        let tail = page.chain(chain)?.tail;
        match tail {
            Some(tail) => {
                page.arena
                    .get_mut(tail)
                    .ok_or(SpillError::BrokenChain(tail))?
                    .next = Some(id);
            }
            None => page.chain_mut(chain)?.head = Some(id),
        }

        let state = page.chain_mut(chain)?;
        state.tail = Some(id);
        state.objects += 1;
        state.watermark = PurgeLevel::None;
        page.stats.resident_bytes += bytes;
        self.report_usage();
        Ok(())
    }

    pub fn object_count(&self, chain: ChainId) -> Result<usize> {
        Ok(live_ref(&self.page)?.chain(chain)?.objects)
    }

    pub fn lookup_watermark(&self, chain: ChainId) -> Result<PurgeLevel> {
        Ok(live_ref(&self.page)?.chain(chain)?.watermark)
    }

    pub fn set_watermark(&mut self, chain: ChainId, level: PurgeLevel) -> Result<()> {
        live(&mut self.page)?.chain_mut(chain)?.watermark = level;
        Ok(())
    }

    /// Snapshot of the containers making up `chain`, head first.
    pub fn containers(&self, chain: ChainId) -> Result<Vec<ContainerInfo>> {
        let page = live_ref(&self.page)?;
        let mut infos = Vec::new();
        let mut cursor = page.chain(chain)?.head;
        while let Some(id) = cursor {
            let container = page.container(id)?;
            let offset = match container.state {
                ContainerState::Resident(_) => None,
                ContainerState::Archived { offset, .. } => Some(offset),
            };
            infos.push(ContainerInfo {
                id,
                archived: container.is_archived(),
                count: container.object_count(),
                offset,
            });
            cursor = container.next;
        }
        Ok(infos)
    }

    /// Heap bytes of payloads still resident in `chain`'s unpacked containers.
    pub fn resident_payload_bytes(&self, chain: ChainId) -> Result<u64> {
        let page = live_ref(&self.page)?;
        let mut bytes = 0;
        let mut cursor = page.chain(chain)?.head;
        while let Some(id) = cursor {
            let container = page.container(id)?;
            if let ContainerState::Resident(object) = &container.state {
                bytes += object.resident_payload_bytes();
            }
            cursor = container.next;
        }
        Ok(bytes)
    }

    /// Spills the payload of the `index`th object of `chain`.
    ///
    /// Returns the resident bytes freed, which is 0 when the object has no
    /// bulky payload, is already spilled, or its record would not fit the
    /// load buffer.
    pub fn archive_payload(&mut self, chain: ChainId, index: usize) -> Result<u64> {
        let result = self.archive_payload_at(chain, index);
        self.settle(result)
    }

    fn archive_payload_at(&mut self, chain: ChainId, index: usize) -> Result<u64> {
        let Self {
            page,
            file,
            load_buffer,
            ..
        } = self;
        let page = live(page)?;
        let Location::Resident(id) = page.locate(chain, index)? else {
            return Ok(0);
        };
        let container = page.arena.get_mut(id).ok_or(SpillError::BrokenChain(id))?;
        let ContainerState::Resident(object) = &mut container.state else {
            return Ok(0);
        };
        archive_object_payload(object, file, load_buffer, &mut page.stats)
    }

    /// The payload of the `index`th object of `chain`, reloading it from the
    /// scratch channel if it was spilled.
    ///
    /// The view borrows the store; the next call may replace what it points at.
    pub fn materialize(&mut self, chain: ChainId, index: usize) -> Result<PayloadView<'_>> {
        let staged = self.stage(chain, index);
        let location = self.settle(staged)?;

        let spilled = spilled_payload(live_ref(&self.page)?.object_at(location)?);
        if let Some((archived, kind)) = spilled {
            let loaded = self.load_buffer.load(&mut self.file, archived, kind);
            self.settle(loaded)?;
            return Ok(self.load_buffer.view());
        }
        Ok(resident_view(live_ref(&self.page)?.object_at(location)?))
    }

    /// The fixed fields of the `index`th object of `chain`.
    pub fn object_header(&mut self, chain: ChainId, index: usize) -> Result<ObjectHeader> {
        let staged = self.stage(chain, index);
        let location = self.settle(staged)?;
        Ok(live_ref(&self.page)?.object_at(location)?.header())
    }

    /// Replaces the mesh of a Gouraud object.
    ///
    /// A spilled mesh is rewritten in place on the scratch channel.
    ///
    /// # Panics
    ///
    /// Panics if the new mesh of a spilled payload encodes to a different
    /// size than the record it replaces.
    pub fn rewrite_payload(
        &mut self,
        chain: ChainId,
        index: usize,
        mesh: GouraudMesh,
    ) -> Result<()> {
        let staged = self.stage(chain, index);
        let location = self.settle(staged)?;
        let result = self.rewrite_at(location, mesh);
        self.settle(result)
    }

    fn rewrite_at(&mut self, location: Location, mesh: GouraudMesh) -> Result<()> {
        let Self {
            page,
            file,
            load_buffer,
            ..
        } = self;
        let page = live(page)?;

        let object = page.object_at(location)?;
        let rewrite = match (&object.payload, location) {
            (Payload::Gouraud(PayloadSlot::Archived(archived)), _) => Rewrite::Spilled(*archived),
            (Payload::Gouraud(PayloadSlot::Resident(_)), Location::Resident(id)) => {
                Rewrite::InChain(id)
            }
            (
                Payload::Gouraud(PayloadSlot::Resident(_)),
                Location::Packed {
                    container, slot, ..
                },
            ) => Rewrite::InBlock(container, slot, object.clone()),
            _ => return Err(SpillError::NotRewritable(object.opcode)),
        };

        match rewrite {
            Rewrite::Spilled(archived) => {
                let body = encode_body(&mesh)?;
                assert_eq!(
                    body.len() as u64,
                    u64::from(archived.len),
                    "rewritten mesh at offset {} must keep its encoded size",
                    archived.offset
                );
                file.overwrite(archived.offset, RecordKind::GouraudPayload, 1, &body)?;
                load_buffer.invalidate(archived.offset);
            }
            Rewrite::InChain(id) => {
                let container = page.arena.get_mut(id).ok_or(SpillError::BrokenChain(id))?;
                if let ContainerState::Resident(object) = &mut container.state {
                    let before = object.resident_payload_bytes();
                    object.payload = Payload::Gouraud(PayloadSlot::Resident(Box::new(mesh)));
                    let after = object.resident_payload_bytes();
                    page.stats.resident_bytes =
                        (page.stats.resident_bytes + after).saturating_sub(before);
                }
            }
            Rewrite::InBlock(container, slot, mut replacement) => {
                replacement.payload = Payload::Gouraud(PayloadSlot::Resident(Box::new(mesh)));
                page.block_cache.write_one(container, slot, replacement)?;
            }
        }
        Ok(())
    }

    /// Loads the aggregate behind an archived container into the block cache
    /// and returns its objects.
    pub fn read_block(&mut self, container: ContainerId) -> Result<&[DisplayObject]> {
        let staged = self.stage_block(container);
        self.settle(staged)?;
        Ok(live_ref(&self.page)?.block_cache.objects())
    }

    /// Replaces one object of the block last loaded by [`Self::read_block`].
    /// The change reaches the scratch channel when the cache is flushed or
    /// another block is read.
    pub fn write_object(
        &mut self,
        container: ContainerId,
        index: usize,
        object: DisplayObject,
    ) -> Result<()> {
        let result = live(&mut self.page)?
            .block_cache
            .write_one(container, index, object);
        self.settle(result)
    }

    pub fn flush_block_cache(&mut self) -> Result<()> {
        let Self { page, file, .. } = self;
        let result = live(page)?.block_cache.flush(file);
        self.settle(result)
    }

    pub fn stats(&self) -> SpillStats {
        self.page
            .as_ref()
            .map(|page| SpillStats {
                block_cache: page.block_cache.stats(),
                ..page.stats
            })
            .unwrap_or_default()
    }

    /// Bytes written to this page's scratch channel.
    pub fn scratch_len(&self) -> u64 {
        self.file.len()
    }

    /// Makes sure the object at `index` can be borrowed: packed objects are
    /// pulled into the block cache.
    fn stage(&mut self, chain: ChainId, index: usize) -> Result<Location> {
        let Self { page, file, .. } = self;
        let page = live(page)?;
        let location = page.locate(chain, index)?;
        if let Location::Packed {
            container,
            offset,
            count,
            ..
        } = location
        {
            page.block_cache.read(file, container, offset, count)?;
        }
        Ok(location)
    }

    fn stage_block(&mut self, container: ContainerId) -> Result<()> {
        let Self { page, file, .. } = self;
        let page = live(page)?;
        let (offset, count) = match page.arena.get(container).map(|node| &node.state) {
            Some(ContainerState::Archived { offset, count }) => (*offset, *count),
            _ => return Err(SpillError::NotArchived(container)),
        };
        page.block_cache.read(file, container, offset, count)?;
        Ok(())
    }

    /// Poisons the page on fatal errors and republishes resident usage.
    pub(crate) fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                if let Some(page) = self.page.as_mut().filter(|page| !page.failed) {
                    page.failed = true;
                    page.block_cache.discard();
                    self.load_buffer.clear();
                    tracing::error!(
                        target: "rip.dlspill",
                        error = %err,
                        "display-list spill failed; page abandoned"
                    );
                }
            }
        }
        self.report_usage();
        result
    }

    fn report_usage(&self) {
        if let Some(tracker) = &self.tracker {
            let bytes = self
                .page
                .as_ref()
                .map_or(0, |page| page.stats.resident_bytes);
            tracker.set_bytes(bytes);
        }
    }
}

impl std::fmt::Debug for DisplayListStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayListStore")
            .field("config", &self.config)
            .field("file", &self.file)
            .field("page", &self.page.as_ref().map(|page| page.chains.len()))
            .finish()
    }
}
