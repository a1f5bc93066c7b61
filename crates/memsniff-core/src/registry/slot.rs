use serde::{Deserialize, Serialize};

/// A handle to a tracked region.
///
/// Handles never own the region they refer to. Each handle carries the
/// generation of the slot it was issued for; once the region is removed
/// the slot's generation moves on and every lookup through the stale
/// handle fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionHandle {
    index: u32,
    generation: u32,
}

impl RegionHandle {
    /// Returns the slot index of the handle.
    pub fn index(self) -> u32 {
        self.index
    }

    /// Returns the generation of the handle.
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for RegionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of values addressed by generation-checked handles.
pub(crate) struct SlotMap<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> SlotMap<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Stores `value`, returning `None` once every index is in use.
    pub fn insert(&mut self, value: T) -> Option<RegionHandle> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.value.is_none());
            slot.value = Some(value);
            self.len += 1;

            return Some(RegionHandle {
                index,
                generation: slot.generation,
            });
        }

        let index = u32::try_from(self.slots.len()).ok()?;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        self.len += 1;

        Some(RegionHandle {
            index,
            generation: 0,
        })
    }

    pub fn get(&self, handle: RegionHandle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }

        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: RegionHandle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }

        slot.value.as_mut()
    }

    pub fn remove(&mut self, handle: RegionHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }

        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;

        Some(value)
    }
}
