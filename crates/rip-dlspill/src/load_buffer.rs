use crate::channel::SpillFile;
use crate::error::{Result, SpillError};
use crate::object::{ArchivedPayload, FillMesh, GouraudMesh, PayloadView};
use crate::record::{decode_body, RecordKind, RECORD_HEADER_LEN};

#[derive(Debug)]
enum Decoded {
    Fill(FillMesh),
    Gouraud(GouraudMesh),
}

/// The single scratch area spilled payloads are reloaded into.
///
/// Only one payload is materialized at a time; loading another replaces it.
#[derive(Debug)]
pub(crate) struct LoadBuffer {
    bytes: Vec<u8>,
    limit: usize,
    largest_record: usize,
    loaded: Option<(ArchivedPayload, Decoded)>,
}

impl LoadBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            largest_record: 0,
            loaded: None,
        }
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn largest_record(&self) -> usize {
        self.largest_record
    }

    /// Makes sure a record of `record_len` bytes (header included) can be
    /// loaded later. Returns `false` when it cannot, in which case the
    /// payload must stay resident.
    pub(crate) fn reserve(&mut self, record_len: usize) -> bool {
        if record_len > self.limit {
            return false;
        }
        if self.bytes.capacity() < record_len {
            self.bytes.clear();
            if self.bytes.try_reserve_exact(record_len).is_err() {
                return false;
            }
        }
        self.largest_record = self.largest_record.max(record_len);
        true
    }

    /// Forgets the decoded payload if it was loaded from `offset`.
    pub(crate) fn invalidate(&mut self, offset: u64) {
        if self
            .loaded
            .as_ref()
            .is_some_and(|(archived, _)| archived.offset == offset)
        {
            self.loaded = None;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.loaded = None;
    }

    /// Reads and decodes a spilled payload; [`LoadBuffer::view`] then sees it.
    pub(crate) fn load(
        &mut self,
        file: &mut SpillFile,
        archived: ArchivedPayload,
        kind: RecordKind,
    ) -> Result<()> {
        let hit = self
            .loaded
            .as_ref()
            .is_some_and(|(loaded, _)| *loaded == archived);
        if !hit {
            self.loaded = None;
            let needed = RECORD_HEADER_LEN + archived.len as usize;
            if !self.reserve(needed) {
                return Err(SpillError::LoadBufferTooSmall {
                    needed,
                    limit: self.limit,
                });
            }
            file.read(archived.offset, kind, 1, Some(archived.len), &mut self.bytes)?;

            let decoded = match kind {
                RecordKind::FillPayload => {
                    let mesh: FillMesh = decode_body(&self.bytes)?;
                    if !mesh.is_consistent() {
                        return Err(SpillError::CorruptRecord {
                            offset: archived.offset,
                            reason: "fill thread spans outside its points",
                        });
                    }
                    Decoded::Fill(mesh)
                }
                RecordKind::GouraudPayload => {
                    let mesh: GouraudMesh = decode_body(&self.bytes)?;
                    if !mesh.is_consistent() {
                        return Err(SpillError::CorruptRecord {
                            offset: archived.offset,
                            reason: "triangle references a missing vertex",
                        });
                    }
                    Decoded::Gouraud(mesh)
                }
                RecordKind::Aggregate => {
                    return Err(SpillError::CorruptRecord {
                        offset: archived.offset,
                        reason: "payload points at an aggregate record",
                    })
                }
            };
            self.loaded = Some((archived, decoded));
        }
        Ok(())
    }

    /// The most recently loaded payload.
    pub(crate) fn view(&self) -> PayloadView<'_> {
        match &self.loaded {
            Some((_, Decoded::Fill(mesh))) => PayloadView::Fill(mesh),
            Some((_, Decoded::Gouraud(mesh))) => PayloadView::Gouraud(mesh),
            None => PayloadView::None,
        }
    }
}
