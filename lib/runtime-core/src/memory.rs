//! Linear memory instances. A memory lives in its compartment's indexed
//! vector and is referenced by module instances; growth commits pages inside
//! the bounds fixed at creation and never moves already-committed bytes out
//! from under running code observably.

use crate::{
    compartment::{Compartment, MemoryId},
    error::{CreationError, Trap},
    types::MemoryType,
    units::{Bytes, Pages, WASM_PAGE_SIZE},
};
use std::sync::{Arc, RwLock};

/// A linear memory instance.
pub struct Memory {
    ty: MemoryType,
    id: MemoryId,
    compartment_id: u64,
    data: RwLock<Vec<u8>>,
}

impl Memory {
    /// Creates a memory of `ty.minimum` committed pages inside the
    /// compartment and registers it under a stable id.
    pub fn new(compartment: &Arc<Compartment>, ty: MemoryType) -> Result<Arc<Memory>, CreationError> {
        if let Some(max) = ty.maximum {
            if max < ty.minimum {
                return Err(CreationError::InvalidDescriptor(
                    "Max memory size is less than the minimum size".to_string(),
                ));
            }
        }
        if ty.minimum > Pages::max() {
            return Err(CreationError::UnableToCreateMemory);
        }

        let mut inner = compartment.lock();
        let id = MemoryId(inner.memories.len());
        let memory = Arc::new(Memory {
            ty,
            id,
            compartment_id: compartment.id(),
            data: RwLock::new(vec![0u8; Bytes::from(ty.minimum).0]),
        });
        inner.memories.push(Arc::clone(&memory));
        Ok(memory)
    }

    /// The descriptor this memory was created from.
    pub fn ty(&self) -> MemoryType {
        self.ty
    }

    /// The memory's stable id within its compartment.
    pub fn id(&self) -> MemoryId {
        self.id
    }

    /// The id of the owning compartment.
    pub fn compartment_id(&self) -> u64 {
        self.compartment_id
    }

    /// The current number of committed pages.
    pub fn pages(&self) -> Pages {
        let data = self.data.read().expect("memory poisoned");
        Pages((data.len() / WASM_PAGE_SIZE) as u32)
    }

    /// The current committed size in bytes.
    pub fn size(&self) -> usize {
        self.data.read().expect("memory poisoned").len()
    }

    /// Grows the memory by `delta_pages`, returning the previous page count,
    /// or -1 when the new total would exceed the declared or addressable
    /// maximum. On failure the memory is unchanged.
    pub fn grow(&self, delta_pages: u32) -> i32 {
        let mut data = self.data.write().expect("memory poisoned");
        let previous_pages = (data.len() / WASM_PAGE_SIZE) as u32;
        if delta_pages == 0 {
            return previous_pages as i32;
        }

        let new_pages = match Pages(previous_pages).checked_add(Pages(delta_pages)) {
            Ok(pages) => pages,
            Err(_) => return -1,
        };
        if let Some(max) = self.ty.maximum {
            if new_pages > max {
                return -1;
            }
        }

        data.resize(Bytes::from(new_pages).0, 0);
        previous_pages as i32
    }

    /// Reads `len` bytes at `offset`, trapping on any out-of-bounds access.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, Trap> {
        let data = self.data.read().expect("memory poisoned");
        let end = offset.checked_add(len).ok_or(Trap::AccessViolation)?;
        if end > data.len() {
            return Err(Trap::AccessViolation);
        }
        Ok(data[offset..end].to_vec())
    }

    /// Writes `bytes` at `offset`, trapping on any out-of-bounds access.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), Trap> {
        let mut data = self.data.write().expect("memory poisoned");
        let end = offset
            .checked_add(bytes.len())
            .ok_or(Trap::AccessViolation)?;
        if end > data.len() {
            return Err(Trap::AccessViolation);
        }
        data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Loads a fixed-width little-endian value, trapping out of bounds.
    pub fn load<const N: usize>(&self, offset: usize) -> Result<[u8; N], Trap> {
        let data = self.data.read().expect("memory poisoned");
        let end = offset.checked_add(N).ok_or(Trap::AccessViolation)?;
        if end > data.len() {
            return Err(Trap::AccessViolation);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&data[offset..end]);
        Ok(out)
    }

    /// Stores a fixed-width little-endian value, trapping out of bounds.
    pub fn store<const N: usize>(&self, offset: usize, value: [u8; N]) -> Result<(), Trap> {
        let mut data = self.data.write().expect("memory poisoned");
        let end = offset.checked_add(N).ok_or(Trap::AccessViolation)?;
        if end > data.len() {
            return Err(Trap::AccessViolation);
        }
        data[offset..end].copy_from_slice(&value);
        Ok(())
    }

    /// Runs `f` over the committed bytes.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.data.read().expect("memory poisoned");
        f(&data)
    }

    /// Runs `f` over the committed bytes, mutably.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.write().expect("memory poisoned");
        f(&mut data)
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("ty", &self.ty)
            .field("pages", &self.pages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::Compartment;

    fn memory(min: u32, max: Option<u32>) -> Arc<Memory> {
        let compartment = Compartment::new();
        Memory::new(
            &compartment,
            MemoryType {
                minimum: Pages(min),
                maximum: max.map(Pages),
            },
        )
        .unwrap()
    }

    #[test]
    fn grow_returns_the_previous_page_count() {
        let mem = memory(1, Some(3));
        assert_eq!(mem.grow(1), 1);
        assert_eq!(mem.pages(), Pages(2));
        assert_eq!(mem.grow(0), 2);
    }

    #[test]
    fn grow_past_the_maximum_fails_without_side_effects() {
        let mem = memory(1, Some(2));
        assert_eq!(mem.grow(5), -1);
        assert_eq!(mem.pages(), Pages(1));
    }

    #[test]
    fn out_of_bounds_accesses_trap() {
        let mem = memory(1, None);
        assert!(mem.write(WASM_PAGE_SIZE - 4, &[1, 2, 3, 4]).is_ok());
        assert_eq!(
            mem.write(WASM_PAGE_SIZE - 3, &[1, 2, 3, 4]),
            Err(Trap::AccessViolation)
        );
        assert_eq!(
            mem.read(usize::max_value(), 2),
            Err(Trap::AccessViolation)
        );
    }
}
