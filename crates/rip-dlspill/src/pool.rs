use crate::container::ContainerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Harvesting ids of freed containers.
    Fill,
    /// Minting replacement containers from harvested ids.
    Drain,
}

/// Bounded stack of spare container ids kept back for aggregation, so a purge
/// pass reuses the nodes it frees instead of going through the arena.
#[derive(Debug)]
pub struct NodePool {
    spares: Vec<ContainerId>,
    capacity: usize,
    mode: PoolMode,
}

impl NodePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            spares: Vec::with_capacity(capacity),
            capacity,
            mode: PoolMode::Fill,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.spares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spares.is_empty()
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    pub fn begin_fill(&mut self) {
        self.mode = PoolMode::Fill;
    }

    pub fn begin_drain(&mut self) {
        self.mode = PoolMode::Drain;
    }

    /// Keeps `id` as a spare. Hands it back when the pool is full or
    /// draining; the caller then frees it for real.
    pub fn give(&mut self, id: ContainerId) -> Result<(), ContainerId> {
        if self.mode != PoolMode::Fill || self.spares.len() >= self.capacity {
            return Err(id);
        }
        self.spares.push(id);
        Ok(())
    }

    pub fn take(&mut self) -> Option<ContainerId> {
        debug_assert_eq!(self.mode, PoolMode::Drain, "take outside of a drain");
        self.spares.pop()
    }

    /// Empties the pool, returning every spare.
    pub fn drain_all(&mut self) -> Vec<ContainerId> {
        self.mode = PoolMode::Fill;
        std::mem::take(&mut self.spares)
    }
}
