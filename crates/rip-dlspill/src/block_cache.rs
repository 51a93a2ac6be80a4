use crate::channel::SpillFile;
use crate::container::ContainerId;
use crate::error::{Result, SpillError};
use crate::object::DisplayObject;
use crate::record::{body_len, decode_body, encode_body, RecordKind};

#[derive(Debug)]
struct CachedBlock {
    container: ContainerId,
    offset: u64,
    record_len: u32,
    objects: Vec<DisplayObject>,
    dirty: bool,
}

/// Counters for the block cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BlockCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub write_backs: u64,
}

/// One-slot write-back cache of decoded aggregate records.
///
/// Updates stay in memory until a different block is read or the cache is
/// flushed, so there must be exactly one reader/writer of the page.
#[derive(Debug, Default)]
pub(crate) struct BlockCache {
    slot: Option<CachedBlock>,
    scratch: Vec<u8>,
    stats: BlockCacheStats,
}

impl BlockCache {
    pub(crate) fn stats(&self) -> BlockCacheStats {
        self.stats
    }

    pub(crate) fn cached(&self) -> Option<ContainerId> {
        self.slot.as_ref().map(|block| block.container)
    }

    pub(crate) fn objects(&self) -> &[DisplayObject] {
        self.slot
            .as_ref()
            .map(|block| block.objects.as_slice())
            .unwrap_or_default()
    }

    pub(crate) fn object(&self, container: ContainerId, index: usize) -> Option<&DisplayObject> {
        self.slot
            .as_ref()
            .filter(|block| block.container == container)
            .and_then(|block| block.objects.get(index))
    }

    /// Brings the aggregate behind `container` into the slot, writing back a
    /// dirty predecessor first.
    pub(crate) fn read(
        &mut self,
        file: &mut SpillFile,
        container: ContainerId,
        offset: u64,
        count: u32,
    ) -> Result<&[DisplayObject]> {
        let hit = self
            .slot
            .as_ref()
            .is_some_and(|block| block.container == container && block.offset == offset);
        if hit {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
            self.flush(file)?;
            self.slot = None;

            let header = file.read(offset, RecordKind::Aggregate, count, None, &mut self.scratch)?;
            let objects: Vec<DisplayObject> = decode_body(&self.scratch)?;
            if objects.len() != count as usize {
                return Err(SpillError::CorruptRecord {
                    offset,
                    reason: "aggregate decoded to the wrong number of objects",
                });
            }
            self.slot = Some(CachedBlock {
                container,
                offset,
                record_len: header.len,
                objects,
                dirty: false,
            });
        }

        Ok(self.objects())
    }

    /// Replaces one object of the cached block and marks it dirty.
    ///
    /// The replacement must encode to the same size as the object it
    /// replaces, since the block is written back in place.
    pub(crate) fn write_one(
        &mut self,
        container: ContainerId,
        index: usize,
        object: DisplayObject,
    ) -> Result<()> {
        let block = self
            .slot
            .as_mut()
            .filter(|block| block.container == container)
            .ok_or(SpillError::BlockNotLoaded(container))?;
        let len = block.objects.len();
        let current = block
            .objects
            .get_mut(index)
            .ok_or(SpillError::ObjectOutOfRange { index, len })?;

        let old_len = body_len(&*current)?;
        let new_len = body_len(&object)?;
        if old_len != new_len {
            let expected = u64::from(block.record_len);
            return Err(SpillError::RecordSizeChanged {
                offset: block.offset,
                expected,
                found: expected - old_len + new_len,
            });
        }

        *current = object;
        block.dirty = true;
        Ok(())
    }

    /// Writes the cached block back if it has pending updates.
    pub(crate) fn flush(&mut self, file: &mut SpillFile) -> Result<()> {
        let Some(block) = self.slot.as_mut().filter(|block| block.dirty) else {
            return Ok(());
        };
        let body = encode_body(&block.objects)?;
        if body.len() as u64 != u64::from(block.record_len) {
            return Err(SpillError::RecordSizeChanged {
                offset: block.offset,
                expected: u64::from(block.record_len),
                found: body.len() as u64,
            });
        }
        file.overwrite(
            block.offset,
            RecordKind::Aggregate,
            block.objects.len() as u32,
            &body,
        )?;
        block.dirty = false;
        self.stats.write_backs += 1;
        tracing::trace!(
            target: "rip.dlspill",
            offset = block.offset,
            count = block.objects.len(),
            "wrote back display-list block"
        );
        Ok(())
    }

    /// Drops the slot without writing it back.
    pub(crate) fn discard(&mut self) {
        self.slot = None;
    }
}
