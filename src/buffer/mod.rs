// Buffer mapping and allocation
//
// Every buffer a plane scans out has to be mapped into the display
// engine's address space first. Mapping is expensive and a buffer may
// be shown by several planes or displays at once, so mappings are
// shared and refcounted here.
pub mod cache;

use crate::backend::{BufferBackend, MappedRegion};
use crate::layer::{BufferHandle, BufferUsage, PixelFormat};
use crate::{HwcError, Result};
use cache::{BufferCache, BufferMapping};
use utils::log;

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt::Write;
use std::ops::Deref;
use std::sync::Arc;

/// Metadata of a graphics buffer as reported by the allocator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBuffer {
    pub db_handle: BufferHandle,
    pub db_format: PixelFormat,
    pub db_width: u32,
    pub db_height: u32,
    /// Row pitch in bytes
    pub db_stride: u32,
    pub db_usage: BufferUsage,
}

impl DataBuffer {
    fn empty() -> Self {
        Self {
            db_handle: 0,
            db_format: PixelFormat::Rgba8888,
            db_width: 0,
            db_height: 0,
            db_stride: 0,
            db_usage: BufferUsage::empty(),
        }
    }

    pub fn is_protected(&self) -> bool {
        self.db_usage.contains(BufferUsage::PROTECTED)
    }
}

/// Exclusive view of one buffer's metadata
///
/// Obtained from `BufferManager::lock_data_buffer`. Only one exists at a
/// time, so holding one while asking for another deadlocks.
pub struct DataBufferGuard<'a> {
    g_buffer: MutexGuard<'a, DataBuffer>,
}

impl<'a> Deref for DataBufferGuard<'a> {
    type Target = DataBuffer;

    fn deref(&self) -> &DataBuffer {
        &self.g_buffer
    }
}

/// A device owned frame buffer
struct FrameBuffer {
    fb_buffer: DataBuffer,
    fb_region: MappedRegion,
}

/// Owns the mapping cache and the frame buffer pool
pub struct BufferManager {
    bm_backend: Arc<dyn BufferBackend>,
    bm_cache: Mutex<BufferCache>,
    /// Scratch metadata handed out by lock_data_buffer
    bm_data_buffer: Mutex<DataBuffer>,
    /// Frame buffers keyed by their kernel framebuffer id
    bm_frame_buffers: Mutex<HashMap<u32, FrameBuffer>>,
}

impl BufferManager {
    pub fn new(backend: Arc<dyn BufferBackend>) -> Self {
        Self {
            bm_backend: backend,
            bm_cache: Mutex::new(BufferCache::new()),
            bm_data_buffer: Mutex::new(DataBuffer::empty()),
            bm_frame_buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a buffer's metadata and hold it until the guard drops
    pub fn lock_data_buffer(&self, handle: BufferHandle) -> Result<DataBufferGuard<'_>> {
        if handle == 0 {
            return Err(HwcError::INVALID_HANDLE);
        }

        let mut guard = self.bm_data_buffer.lock();
        *guard = self.bm_backend.describe(handle)?;
        Ok(DataBufferGuard { g_buffer: guard })
    }

    pub fn unlock_data_buffer(&self, guard: DataBufferGuard<'_>) {
        drop(guard);
    }

    /// Map a buffer, or take another reference if it already is
    ///
    /// A failed hardware map leaves no trace in the cache.
    pub fn map(&self, buffer: &DataBuffer) -> Result<BufferMapping> {
        let mut cache = self.bm_cache.lock();
        if let Some(mapping) = cache.retain(buffer.db_handle) {
            return Ok(mapping.clone());
        }

        let region = self.bm_backend.map(buffer).map_err(|e| {
            log::error!("Failed to map buffer {:#x}: {}", buffer.db_handle, e);
            e
        })?;
        log::debug!(
            "Mapped buffer {:#x} at {:#x}",
            buffer.db_handle,
            region.mr_gtt_offset
        );

        Ok(cache
            .insert(BufferMapping::new(buffer.clone(), region))
            .clone())
    }

    /// Drop one reference to the mapping of `handle`
    ///
    /// The hardware mapping is torn down along with the last reference.
    pub fn unmap(&self, handle: BufferHandle) {
        let mut cache = self.bm_cache.lock();
        if !cache.contains(handle) {
            log::error!("Unmapping buffer {:#x} which is not mapped", handle);
            return;
        }

        if let Some(mapping) = cache.release(handle) {
            log::debug!("Unmapping buffer {:#x}", handle);
            self.bm_backend
                .unmap(&mapping.bm_buffer, &mapping.bm_region);
        }
    }

    /// Snapshot of the mapping for `handle`
    pub fn mapping(&self, handle: BufferHandle) -> Option<BufferMapping> {
        self.bm_cache.lock().get(handle).cloned()
    }

    pub fn ref_count(&self, handle: BufferHandle) -> usize {
        self.bm_cache.lock().get(handle).map(|m| m.refs()).unwrap_or(0)
    }

    pub fn is_mapped(&self, handle: BufferHandle) -> bool {
        self.bm_cache.lock().contains(handle)
    }

    /// Number of live mappings
    pub fn len(&self) -> usize {
        self.bm_cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bm_cache.lock().is_empty()
    }

    /// Allocate a plain graphics buffer
    pub fn alloc_buffer(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> Result<(BufferHandle, u32)> {
        self.bm_backend
            .alloc(width, height, format, usage)
            .map_err(|e| {
                log::error!("Failed to allocate {}x{} buffer: {}", width, height, e);
                HwcError::ALLOC_FAILED
            })
    }

    pub fn free_buffer(&self, handle: BufferHandle) {
        self.bm_backend.free(handle);
    }

    /// Allocate a scanout buffer owned by the display device
    ///
    /// Returns the kernel framebuffer id and the stride in bytes. The
    /// buffer stays mapped until `free_frame_buffer`.
    pub fn alloc_frame_buffer(&self, width: u32, height: u32) -> Result<(u32, u32)> {
        let (handle, stride) = self.alloc_buffer(
            width,
            height,
            PixelFormat::Bgrx8888,
            BufferUsage::HW_COMPOSER | BufferUsage::HW_FB,
        )?;

        let buffer = match self.bm_backend.describe(handle) {
            Ok(b) => b,
            Err(e) => {
                self.bm_backend.free(handle);
                return Err(e);
            }
        };

        let region = match self.bm_backend.map(&buffer) {
            Ok(r) => r,
            Err(e) => {
                log::error!("Failed to map frame buffer {:#x}: {}", handle, e);
                self.bm_backend.free(handle);
                return Err(e);
            }
        };

        let fb = match self.bm_backend.fb_handle(&buffer) {
            Ok(fb) => fb,
            Err(e) => {
                log::error!("Failed to get fb handle for {:#x}: {}", handle, e);
                self.bm_backend.unmap(&buffer, &region);
                self.bm_backend.free(handle);
                return Err(e);
            }
        };

        log::debug!("Allocated frame buffer {} ({}x{})", fb, width, height);
        self.bm_frame_buffers.lock().insert(
            fb,
            FrameBuffer {
                fb_buffer: buffer,
                fb_region: region,
            },
        );
        Ok((fb, stride))
    }

    pub fn free_frame_buffer(&self, fb: u32) {
        let entry = self.bm_frame_buffers.lock().remove(&fb);
        match entry {
            Some(entry) => self.release_frame_buffer(fb, entry),
            None => log::error!("Freeing unknown frame buffer {}", fb),
        }
    }

    fn release_frame_buffer(&self, fb: u32, entry: FrameBuffer) {
        self.bm_backend.release_fb_handle(fb);
        self.bm_backend.unmap(&entry.fb_buffer, &entry.fb_region);
        self.bm_backend.free(entry.fb_buffer.db_handle);
    }

    pub fn frame_buffer_count(&self) -> usize {
        self.bm_frame_buffers.lock().len()
    }

    /// Tear down every mapping and frame buffer
    pub fn deinitialize(&self) {
        let frame_buffers: Vec<(u32, FrameBuffer)> =
            self.bm_frame_buffers.lock().drain().collect();
        for (fb, entry) in frame_buffers {
            self.release_frame_buffer(fb, entry);
        }

        let mappings = self.bm_cache.lock().drain();
        if !mappings.is_empty() {
            log::info!("Releasing {} buffer mappings", mappings.len());
        }
        for mapping in mappings {
            self.bm_backend
                .unmap(&mapping.bm_buffer, &mapping.bm_region);
        }
    }

    pub fn dump(&self, d: &mut String) {
        let cache = self.bm_cache.lock();
        let _ = writeln!(d, "Buffer mappings: {}", cache.len());
        let _ = writeln!(d, "  handle    | refs | offset     | size");
        let _ = writeln!(d, "  ----------+------+------------+----------");
        let mut entries: Vec<&BufferMapping> = cache.iter().collect();
        entries.sort_by_key(|m| m.handle());
        for m in entries {
            let _ = writeln!(
                d,
                "  {:#010x}| {:4} | {:#010x} | {}",
                m.handle(),
                m.refs(),
                m.bm_region.mr_gtt_offset,
                m.bm_region.mr_size
            );
        }
        let _ = writeln!(d, "Frame buffers: {}", self.frame_buffer_count());
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.deinitialize();
    }
}
