// Handle keyed arena of buffer mappings
//
use crate::backend::MappedRegion;
use crate::buffer::DataBuffer;
use crate::layer::BufferHandle;

use std::collections::HashMap;

/// One graphics buffer mapped into display memory
///
/// The cache is the only owner. Everyone else refers to a mapping by
/// its buffer handle and holds one count of `bm_refs` while doing so.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferMapping {
    pub bm_buffer: DataBuffer,
    pub bm_region: MappedRegion,
    bm_refs: usize,
}

impl BufferMapping {
    pub fn new(buffer: DataBuffer, region: MappedRegion) -> Self {
        Self {
            bm_buffer: buffer,
            bm_region: region,
            bm_refs: 0,
        }
    }

    pub fn handle(&self) -> BufferHandle {
        self.bm_buffer.db_handle
    }

    pub fn refs(&self) -> usize {
        self.bm_refs
    }

    fn inc_ref(&mut self) {
        self.bm_refs += 1;
    }

    // returns the remaining count
    fn dec_ref(&mut self) -> usize {
        self.bm_refs = self.bm_refs.saturating_sub(1);
        self.bm_refs
    }
}

/// Refcounted mappings indexed by buffer handle
///
/// An entry exists exactly while its count is above zero. This does
/// no locking, the BufferManager serializes access.
pub struct BufferCache {
    bc_entries: HashMap<BufferHandle, BufferMapping>,
}

impl BufferCache {
    pub fn new() -> Self {
        Self {
            bc_entries: HashMap::new(),
        }
    }

    pub fn get(&self, handle: BufferHandle) -> Option<&BufferMapping> {
        self.bc_entries.get(&handle)
    }

    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.bc_entries.contains_key(&handle)
    }

    /// Take one more reference on an existing entry
    ///
    /// Returns None if the handle is not cached.
    pub fn retain(&mut self, handle: BufferHandle) -> Option<&BufferMapping> {
        let entry = self.bc_entries.get_mut(&handle)?;
        entry.inc_ref();
        Some(entry)
    }

    /// Add a new mapping holding its first reference
    pub fn insert(&mut self, mut mapping: BufferMapping) -> &BufferMapping {
        let handle = mapping.handle();
        mapping.bm_refs = 1;
        self.bc_entries.insert(handle, mapping);
        &self.bc_entries[&handle]
    }

    /// Drop one reference
    ///
    /// When the last reference goes away the entry is evicted and
    /// handed back so the caller can tear down the hardware mapping.
    /// Releasing an unknown handle does nothing and returns None.
    pub fn release(&mut self, handle: BufferHandle) -> Option<BufferMapping> {
        let remaining = self.bc_entries.get_mut(&handle)?.dec_ref();
        if remaining > 0 {
            return None;
        }
        self.bc_entries.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.bc_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bc_entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferMapping> {
        self.bc_entries.values()
    }

    /// Remove every entry regardless of its count
    pub fn drain(&mut self) -> Vec<BufferMapping> {
        self.bc_entries.drain().map(|(_, m)| m).collect()
    }
}
