use serde::{Deserialize, Serialize};

use crate::object::DisplayObject;

/// How far eviction has progressed on a chain.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PurgeLevel {
    #[default]
    None = 0,
    /// Bulky payloads have been spilled.
    Payloads = 1,
    /// Runs of object headers have been packed into aggregate records.
    Aggregated = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId(u32);

impl ContainerId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainId(u32);

impl ChainId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug)]
pub(crate) enum ContainerState {
    Resident(Box<DisplayObject>),
    /// `count >= 1` objects packed in one aggregate record.
    Archived { offset: u64, count: u32 },
}

#[derive(Debug)]
pub(crate) struct Container {
    pub(crate) state: ContainerState,
    pub(crate) next: Option<ContainerId>,
}

impl Container {
    pub(crate) fn resident(object: DisplayObject) -> Self {
        Self {
            state: ContainerState::Resident(Box::new(object)),
            next: None,
        }
    }

    pub(crate) fn object_count(&self) -> usize {
        match &self.state {
            ContainerState::Resident(_) => 1,
            ContainerState::Archived { count, .. } => *count as usize,
        }
    }

    pub(crate) fn is_archived(&self) -> bool {
        matches!(self.state, ContainerState::Archived { .. })
    }

    /// Memory held by the node, its object, and the object's payload.
    pub(crate) fn resident_bytes(&self) -> u64 {
        let node = std::mem::size_of::<Self>() as u64;
        match &self.state {
            ContainerState::Resident(object) => node + object.resident_bytes(),
            ContainerState::Archived { .. } => node,
        }
    }
}

/// Public snapshot of one container in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub archived: bool,
    pub count: usize,
    pub offset: Option<u64>,
}

/// A per-group, singly linked sequence of containers.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Chain {
    pub(crate) head: Option<ContainerId>,
    pub(crate) tail: Option<ContainerId>,
    pub(crate) watermark: PurgeLevel,
    pub(crate) objects: usize,
}

/// Slot storage for container nodes.
///
/// Freed slots are reused by later allocations. A slot may also be *taken*
/// without being freed, which empties it but keeps it reserved so the node
/// pool can hand the same id out again.
#[derive(Debug, Default)]
pub(crate) struct ContainerArena {
    slots: Vec<Option<Container>>,
    vacant: Vec<ContainerId>,
    live: usize,
}

impl ContainerArena {
    pub(crate) fn alloc(&mut self, container: Container) -> ContainerId {
        self.live += 1;
        if let Some(id) = self.vacant.pop() {
            self.slots[id.index()] = Some(container);
            return id;
        }
        let id = ContainerId(self.slots.len() as u32);
        self.slots.push(Some(container));
        id
    }

    /// Empties a slot without releasing its id.
    pub(crate) fn take(&mut self, id: ContainerId) -> Option<Container> {
        let container = self.slots.get_mut(id.index())?.take()?;
        self.live -= 1;
        Some(container)
    }

    /// Refills a slot previously emptied with [`ContainerArena::take`].
    pub(crate) fn install(&mut self, id: ContainerId, container: Container) {
        debug_assert!(self.slots[id.index()].is_none(), "slot {id:?} still occupied");
        self.slots[id.index()] = Some(container);
        self.live += 1;
    }

    /// Returns an emptied slot's id to the general free list.
    pub(crate) fn recycle(&mut self, id: ContainerId) {
        debug_assert!(self.slots[id.index()].is_none(), "slot {id:?} still occupied");
        self.vacant.push(id);
    }

    pub(crate) fn get(&self, id: ContainerId) -> Option<&Container> {
        self.slots.get(id.index())?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: ContainerId) -> Option<&mut Container> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    pub(crate) fn next(&self, id: ContainerId) -> Option<ContainerId> {
        self.get(id).and_then(|container| container.next)
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }
}
