// Display planes
//
// A plane is a fixed function scanout engine. It fetches one buffer,
// optionally scales/rotates it, and blends it with the planes below.
pub mod manager;

use crate::backend::PlaneFlip;
use crate::buffer::cache::BufferMapping;
use crate::buffer::BufferManager;
use crate::layer::{BufferHandle, Transform};
use crate::{HwcError, Result};
use utils::log;
use utils::region::Rect;

use std::collections::VecDeque;
use std::fmt;

/// Buffers a plane keeps mapped after flipping away from them. The
/// hardware may still be scanning the previous one.
const MIN_DATA_BUFFER_COUNT: usize = 2;
/// Most mappings a plane caches before starting over
const DATA_BUFFER_CACHE_CAPACITY: usize = 8;

/// Capability class of a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PlaneType {
    Sprite,
    Overlay,
    Primary,
    Cursor,
}

impl PlaneType {
    pub const COUNT: usize = 4;
    pub const ALL: [PlaneType; PlaneType::COUNT] = [
        PlaneType::Sprite,
        PlaneType::Overlay,
        PlaneType::Primary,
        PlaneType::Cursor,
    ];

    pub fn index(self) -> usize {
        match self {
            PlaneType::Sprite => 0,
            PlaneType::Overlay => 1,
            PlaneType::Primary => 2,
            PlaneType::Cursor => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PlaneType::Sprite => "sprite",
            PlaneType::Overlay => "overlay",
            PlaneType::Primary => "primary",
            PlaneType::Cursor => "cursor",
        }
    }

    /// Primary and cursor planes are wired to one display pipe
    pub fn is_display_bound(self) -> bool {
        matches!(self, PlaneType::Primary | PlaneType::Cursor)
    }
}

/// Identifies one plane of the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaneRef {
    pub pr_type: PlaneType,
    pub pr_index: usize,
}

impl PlaneRef {
    pub fn new(ty: PlaneType, index: usize) -> Self {
        Self {
            pr_type: ty,
            pr_index: index,
        }
    }
}

impl fmt::Display for PlaneRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.pr_type.name(), self.pr_index)
    }
}

bitflags! {
    /// Plane attributes changed since the last flip
    #[derive(Default)]
    pub struct PlaneUpdate: u32 {
        const POSITION = 0x01;
        const SOURCE_CROP = 0x02;
        const TRANSFORM = 0x04;
        const BUFFER = 0x08;
        const ALPHA = 0x10;
    }
}

/// Software state of one hardware plane
pub struct DisplayPlane {
    p_ref: PlaneRef,
    /// Display this plane is attached to
    p_device: Option<usize>,
    /// Stacking slot within that display
    p_zorder: usize,
    p_position: Rect<i32>,
    p_crop: Rect<f32>,
    p_transform: Transform,
    p_alpha: u8,
    /// The buffer to show on the next flip
    p_current: Option<BufferMapping>,
    /// Handles we hold one mapping reference on
    p_cache: Vec<BufferHandle>,
    /// Recently flipped buffers, each holding one more reference
    p_active: VecDeque<BufferHandle>,
    p_update: PlaneUpdate,
    /// Has flipped a buffer since it was last reset
    p_displayed: bool,
    /// Flip count at which the hardware was told to turn this off
    p_disabled_at: Option<u64>,
}

impl DisplayPlane {
    pub fn new(r: PlaneRef) -> Self {
        Self {
            p_ref: r,
            p_device: None,
            p_zorder: 0,
            p_position: Rect::default(),
            p_crop: Rect::default(),
            p_transform: Transform::empty(),
            p_alpha: 0xff,
            p_current: None,
            p_cache: Vec::new(),
            p_active: VecDeque::new(),
            p_update: PlaneUpdate::empty(),
            p_displayed: false,
            p_disabled_at: None,
        }
    }

    pub fn get_ref(&self) -> PlaneRef {
        self.p_ref
    }

    pub fn plane_type(&self) -> PlaneType {
        self.p_ref.pr_type
    }

    pub fn device(&self) -> Option<usize> {
        self.p_device
    }

    pub fn zorder(&self) -> usize {
        self.p_zorder
    }

    pub fn update_mask(&self) -> PlaneUpdate {
        self.p_update
    }

    pub fn current_buffer(&self) -> Option<BufferHandle> {
        self.p_current.as_ref().map(|m| m.handle())
    }

    /// Has this plane shown anything since it was handed out
    pub fn is_displaying(&self) -> bool {
        self.p_displayed
    }

    pub fn assign_to_device(&mut self, display: usize) {
        self.p_device = Some(display);
    }

    pub fn set_zorder(&mut self, zorder: usize) {
        self.p_zorder = zorder;
    }

    pub fn set_position(&mut self, position: Rect<i32>) {
        if self.p_position != position {
            self.p_position = position;
            self.p_update |= PlaneUpdate::POSITION;
        }
    }

    pub fn set_source_crop(&mut self, crop: Rect<f32>) {
        if self.p_crop != crop {
            self.p_crop = crop;
            self.p_update |= PlaneUpdate::SOURCE_CROP;
        }
    }

    pub fn set_transform(&mut self, transform: Transform) {
        if self.p_transform != transform {
            self.p_transform = transform;
            self.p_update |= PlaneUpdate::TRANSFORM;
        }
    }

    pub fn set_plane_alpha(&mut self, alpha: u8) {
        if self.p_alpha != alpha {
            self.p_alpha = alpha;
            self.p_update |= PlaneUpdate::ALPHA;
        }
    }

    /// Point this plane at a new buffer, mapping it if needed
    ///
    /// On failure the plane keeps its previous buffer.
    pub fn set_data_buffer(&mut self, handle: BufferHandle, bm: &BufferManager) -> Result<()> {
        if handle == 0 {
            return Err(HwcError::INVALID_HANDLE);
        }
        if self.current_buffer() == Some(handle) {
            return Ok(());
        }

        let mapping = match self.p_cache.contains(&handle) {
            true => bm.mapping(handle).ok_or(HwcError::MAP_FAILED)?,
            false => {
                let guard = bm.lock_data_buffer(handle)?;
                let buffer = (*guard).clone();
                bm.unlock_data_buffer(guard);

                let mapping = bm.map(&buffer)?;
                if self.p_cache.len() >= DATA_BUFFER_CACHE_CAPACITY {
                    log::debug!("{}: buffer cache full, invalidating", self.p_ref);
                    self.invalidate_buffer_cache(bm);
                }
                self.p_cache.push(handle);
                mapping
            }
        };

        self.p_current = Some(mapping);
        self.p_update |= PlaneUpdate::BUFFER;
        Ok(())
    }

    fn invalidate_buffer_cache(&mut self, bm: &BufferManager) {
        for handle in self.p_cache.drain(..) {
            bm.unmap(handle);
        }
        // the current buffer's mapping may just have gone away
        self.p_current = None;
    }

    /// Scanout state for the next flip, None if there is nothing to show
    pub fn flip_state(&self) -> Option<PlaneFlip> {
        let current = self.p_current.as_ref()?;
        Some(PlaneFlip {
            pf_plane: self.p_ref,
            pf_zorder: self.p_zorder,
            pf_handle: current.handle(),
            pf_offset: current.bm_region.mr_gtt_offset,
            pf_position: self.p_position,
            pf_crop: self.p_crop,
            pf_transform: self.p_transform,
            pf_alpha: self.p_alpha,
        })
    }

    /// Bookkeeping after the hardware accepted a flip of this plane
    ///
    /// The flipped buffer joins the active list so it stays mapped
    /// while the hardware might still read it.
    pub fn post_flip(&mut self, bm: &BufferManager) {
        self.p_update = PlaneUpdate::empty();
        self.p_displayed = true;
        self.p_disabled_at = None;

        let current = match self.p_current.as_ref() {
            Some(c) => c,
            None => return,
        };
        if self.p_active.back() == Some(&current.handle()) {
            return;
        }

        match bm.map(&current.bm_buffer) {
            Ok(_) => self.p_active.push_back(current.handle()),
            Err(e) => log::error!("{}: could not hold flipped buffer: {}", self.p_ref, e),
        }
        while self.p_active.len() > MIN_DATA_BUFFER_COUNT {
            if let Some(old) = self.p_active.pop_front() {
                bm.unmap(old);
            }
        }
    }

    /// Record that the hardware was told to turn this plane off
    pub fn disable(&mut self, flips: u64) {
        if self.p_disabled_at.is_none() {
            self.p_disabled_at = Some(flips);
        }
    }

    pub fn is_disable_pending(&self) -> bool {
        self.p_disabled_at.is_none()
    }

    /// Has the flip that turned this plane off been replaced by another
    pub fn is_disabled(&self, flips: u64) -> bool {
        match self.p_disabled_at {
            Some(at) => flips > at + 1,
            None => false,
        }
    }

    /// Drop every buffer reference and detach from the display
    pub fn reset(&mut self, bm: &BufferManager) {
        self.invalidate_buffer_cache(bm);
        for handle in self.p_active.drain(..) {
            bm.unmap(handle);
        }

        self.p_device = None;
        self.p_zorder = 0;
        self.p_position = Rect::default();
        self.p_crop = Rect::default();
        self.p_transform = Transform::empty();
        self.p_alpha = 0xff;
        self.p_update = PlaneUpdate::empty();
        self.p_displayed = false;
        self.p_disabled_at = None;
    }
}

impl fmt::Debug for DisplayPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayPlane")
            .field("plane", &self.p_ref)
            .field("device", &self.p_device)
            .field("zorder", &self.p_zorder)
            .field("buffer", &self.current_buffer())
            .field("active", &self.p_active)
            .finish()
    }
}
