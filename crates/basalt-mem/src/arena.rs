//! # Allocation Arena
//!
//! Slot storage for graphics allocations, addressed by generational
//! handles. Freeing a slot bumps its generation, so handles kept by a
//! destroyed queue cannot reach whatever occupies the slot next.

use alloc::vec::Vec;

use basalt_core::{AllocationHandle, Error, Result};

use crate::allocation::GraphicsAllocation;

#[derive(Debug)]
struct Slot {
    generation: u32,
    value: Option<GraphicsAllocation>,
}

/// Device-owned arena of graphics allocations
#[derive(Debug, Default)]
pub struct AllocationArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl AllocationArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an allocation and return its handle
    pub fn insert(&mut self, allocation: GraphicsAllocation) -> AllocationHandle {
        self.live += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(allocation);
            return AllocationHandle::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(allocation),
        });
        AllocationHandle::new(index, 0)
    }

    /// Look up an allocation
    pub fn get(&self, handle: AllocationHandle) -> Result<&GraphicsAllocation> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_ref())
            .ok_or(Error::InvalidHandle)
    }

    /// Look up an allocation mutably
    pub fn get_mut(&mut self, handle: AllocationHandle) -> Result<&mut GraphicsAllocation> {
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_mut())
            .ok_or(Error::InvalidHandle)
    }

    /// Remove an allocation, invalidating its handle
    pub fn remove(&mut self, handle: AllocationHandle) -> Result<GraphicsAllocation> {
        let slot = self
            .slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .ok_or(Error::InvalidHandle)?;
        let value = slot.value.take().ok_or(Error::InvalidHandle)?;

        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index());
        self.live -= 1;

        Ok(value)
    }

    /// Whether the handle refers to a live allocation
    pub fn contains(&self, handle: AllocationHandle) -> bool {
        self.get(handle).is_ok()
    }

    /// Number of live allocations
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether the arena holds no allocation
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Iterate over live allocations
    pub fn iter(&self) -> impl Iterator<Item = (AllocationHandle, &GraphicsAllocation)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (AllocationHandle::new(index as u32, slot.generation), value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_core::{AllocationType, ByteSize, GpuAddr};

    fn buffer(addr: u64) -> GraphicsAllocation {
        GraphicsAllocation::new(
            AllocationType::Buffer,
            GpuAddr::new(addr),
            ByteSize::KIB_4,
            0,
            false,
        )
    }

    #[test]
    fn test_arena_insert_get() {
        let mut arena = AllocationArena::new();
        let h = arena.insert(buffer(0x1000));

        assert_eq!(arena.get(h).map(|a| a.gpu_addr()), Ok(GpuAddr::new(0x1000)));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut arena = AllocationArena::new();
        let old = arena.insert(buffer(0x1000));
        arena.remove(old).expect("live");

        let new = arena.insert(buffer(0x2000));
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);
        assert!(arena.get(old).is_err());
        assert!(arena.remove(old).is_err());
        assert_eq!(arena.get(new).map(|a| a.gpu_addr()), Ok(GpuAddr::new(0x2000)));
    }

    #[test]
    fn test_iter_skips_free_slots() {
        let mut arena = AllocationArena::new();
        let a = arena.insert(buffer(0x1000));
        let _b = arena.insert(buffer(0x2000));
        arena.remove(a).expect("live");

        let addrs: Vec<_> = arena.iter().map(|(_, alloc)| alloc.gpu_addr()).collect();
        assert_eq!(addrs, [GpuAddr::new(0x2000)]);
        assert_eq!(arena.len(), 1);
    }
}
