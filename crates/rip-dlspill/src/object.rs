//! Display objects and their payloads.
//!
//! Bulky payloads (fill meshes and Gouraud meshes) reference their own
//! elements by index into arrays they own rather than by address. A payload is
//! therefore position independent: spilling it is a plain encode, and loading
//! it back anywhere yields a usable mesh once the indices are checked.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BBox {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl BBox {
    pub const fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }
}

/// Per-object rendering flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectFlags(u16);

impl ObjectFlags {
    /// Object was merged into a pseudo-vignette rollover.
    pub const ROLLOVER: Self = Self(1 << 0);
    pub const KNOCKOUT: Self = Self(1 << 1);
    pub const OVERPRINT: Self = Self(1 << 2);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    Rect,
    Glyphs,
    Fill,
    Gouraud,
}

impl Opcode {
    /// Whether objects with this opcode carry a payload that can live on disk.
    pub fn has_bulky_payload(self) -> bool {
        matches!(self, Opcode::Fill | Opcode::Gouraud)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// One edge thread of a fill: a span of the owning mesh's points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FillThread {
    pub start: u32,
    pub len: u32,
    pub winding: i8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillMesh {
    pub threads: Vec<FillThread>,
    pub points: Vec<Point>,
}

impl FillMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a thread made of `points` and returns its index.
    pub fn push_thread(&mut self, points: &[Point], winding: i8) -> usize {
        let start = self.points.len() as u32;
        self.points.extend_from_slice(points);
        self.threads.push(FillThread {
            start,
            len: points.len() as u32,
            winding,
        });
        self.threads.len() - 1
    }

    pub fn thread_points(&self, thread: usize) -> Option<&[Point]> {
        let thread = self.threads.get(thread)?;
        let start = thread.start as usize;
        let end = start.checked_add(thread.len as usize)?;
        self.points.get(start..end)
    }

    pub fn is_consistent(&self) -> bool {
        (0..self.threads.len()).all(|thread| self.thread_points(thread).is_some())
    }

    pub fn resident_bytes(&self) -> u64 {
        (std::mem::size_of::<Self>()
            + self.threads.capacity() * std::mem::size_of::<FillThread>()
            + self.points.capacity() * std::mem::size_of::<Point>()) as u64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GouraudVertex {
    pub x: i32,
    pub y: i32,
    pub color: [u16; 4],
}

/// Smooth-shaded triangles over a shared vertex array.
///
/// The only payload that may be edited after it has been spilled; edits must
/// keep its encoded size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GouraudMesh {
    pub vertices: Vec<GouraudVertex>,
    pub triangles: Vec<[u32; 3]>,
}

impl GouraudMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_consistent(&self) -> bool {
        let len = self.vertices.len();
        self.triangles
            .iter()
            .all(|triangle| triangle.iter().all(|&vertex| (vertex as usize) < len))
    }

    pub fn resident_bytes(&self) -> u64 {
        (std::mem::size_of::<Self>()
            + self.vertices.capacity() * std::mem::size_of::<GouraudVertex>()
            + self.triangles.capacity() * std::mem::size_of::<[u32; 3]>()) as u64
    }
}

/// Location of a spilled payload record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchivedPayload {
    pub offset: u64,
    /// Encoded body length, excluding the record header.
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadSlot<T> {
    Resident(Box<T>),
    Archived(ArchivedPayload),
}

impl<T> PayloadSlot<T> {
    pub fn is_archived(&self) -> bool {
        matches!(self, PayloadSlot::Archived(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    None,
    Glyphs { glyph_ids: Vec<u16> },
    Fill(PayloadSlot<FillMesh>),
    Gouraud(PayloadSlot<GouraudMesh>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayObject {
    pub opcode: Opcode,
    pub flags: ObjectFlags,
    pub bbox: BBox,
    pub payload: Payload,
}

impl DisplayObject {
    pub fn rect(bbox: BBox) -> Self {
        Self {
            opcode: Opcode::Rect,
            flags: ObjectFlags::empty(),
            bbox,
            payload: Payload::None,
        }
    }

    pub fn glyphs(bbox: BBox, glyph_ids: Vec<u16>) -> Self {
        Self {
            opcode: Opcode::Glyphs,
            flags: ObjectFlags::empty(),
            bbox,
            payload: Payload::Glyphs { glyph_ids },
        }
    }

    pub fn fill(bbox: BBox, mesh: FillMesh) -> Self {
        Self {
            opcode: Opcode::Fill,
            flags: ObjectFlags::empty(),
            bbox,
            payload: Payload::Fill(PayloadSlot::Resident(Box::new(mesh))),
        }
    }

    pub fn gouraud(bbox: BBox, mesh: GouraudMesh) -> Self {
        Self {
            opcode: Opcode::Gouraud,
            flags: ObjectFlags::empty(),
            bbox,
            payload: Payload::Gouraud(PayloadSlot::Resident(Box::new(mesh))),
        }
    }

    pub fn with_flags(mut self, flags: ObjectFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn header(&self) -> ObjectHeader {
        ObjectHeader {
            opcode: self.opcode,
            flags: self.flags,
            bbox: self.bbox,
            payload_archived: self.is_payload_archived(),
        }
    }

    pub fn is_payload_archived(&self) -> bool {
        match &self.payload {
            Payload::Fill(slot) => slot.is_archived(),
            Payload::Gouraud(slot) => slot.is_archived(),
            Payload::None | Payload::Glyphs { .. } => false,
        }
    }

    /// Heap bytes owned by the payload while it is resident.
    pub fn resident_payload_bytes(&self) -> u64 {
        match &self.payload {
            Payload::None => 0,
            Payload::Glyphs { glyph_ids } => {
                (glyph_ids.capacity() * std::mem::size_of::<u16>()) as u64
            }
            Payload::Fill(PayloadSlot::Resident(mesh)) => mesh.resident_bytes(),
            Payload::Gouraud(PayloadSlot::Resident(mesh)) => mesh.resident_bytes(),
            Payload::Fill(PayloadSlot::Archived(_))
            | Payload::Gouraud(PayloadSlot::Archived(_)) => 0,
        }
    }

    /// Bytes owned by a boxed object, payload included.
    pub fn resident_bytes(&self) -> u64 {
        std::mem::size_of::<Self>() as u64 + self.resident_payload_bytes()
    }
}

/// The fixed part of a display object, detached from its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    pub opcode: Opcode,
    pub flags: ObjectFlags,
    pub bbox: BBox,
    pub payload_archived: bool,
}

/// Read-only access to an object's payload, wherever it currently lives.
///
/// Views into reloaded payloads borrow the store's scratch area and are
/// invalidated by the next load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadView<'a> {
    None,
    Glyphs(&'a [u16]),
    Fill(&'a FillMesh),
    Gouraud(&'a GouraudMesh),
}

impl<'a> PayloadView<'a> {
    pub fn fill(self) -> Option<&'a FillMesh> {
        match self {
            PayloadView::Fill(mesh) => Some(mesh),
            _ => None,
        }
    }

    pub fn gouraud(self) -> Option<&'a GouraudMesh> {
        match self {
            PayloadView::Gouraud(mesh) => Some(mesh),
            _ => None,
        }
    }
}
