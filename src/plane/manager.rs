// Plane inventory bookkeeping
//
// Planes of one class are tracked with bitmasks. A plane is free,
// in use by a display, or reclaimed: released but possibly still being
// scanned out, waiting for the hardware to turn it off.
use super::{DisplayPlane, PlaneRef, PlaneType};
use crate::buffer::BufferManager;
use crate::config::{PlaneInventory, MAX_PLANES_PER_TYPE};
use crate::{HwcError, Result};
use utils::log;

use std::fmt::Write;

/// One entry of a display's plane stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZOrderLayer {
    pub zl_type: PlaneType,
    /// Stacking slot, 0 is the bottom
    pub zl_zorder: usize,
    /// Filled in once the plane has been acquired
    pub zl_plane: Option<PlaneRef>,
    /// Index of the layer in the display's list
    pub zl_layer: usize,
}

/// The plane stack of one display for one frame, sorted by zorder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZOrderConfig {
    zc_layers: Vec<ZOrderLayer>,
}

impl ZOrderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry keeping the list sorted
    pub fn add(&mut self, ty: PlaneType, zorder: usize, layer: usize) {
        let pos = self
            .zc_layers
            .iter()
            .position(|zl| zl.zl_zorder > zorder)
            .unwrap_or(self.zc_layers.len());
        self.zc_layers.insert(
            pos,
            ZOrderLayer {
                zl_type: ty,
                zl_zorder: zorder,
                zl_plane: None,
                zl_layer: layer,
            },
        );
    }

    pub fn remove_layer(&mut self, layer: usize) -> Option<ZOrderLayer> {
        let pos = self.zc_layers.iter().position(|zl| zl.zl_layer == layer)?;
        Some(self.zc_layers.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.zc_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zc_layers.is_empty()
    }

    pub fn clear(&mut self) {
        self.zc_layers.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &ZOrderLayer> {
        self.zc_layers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ZOrderLayer> {
        self.zc_layers.iter_mut()
    }

    pub fn count(&self, ty: PlaneType) -> usize {
        self.zc_layers.iter().filter(|zl| zl.zl_type == ty).count()
    }

    pub fn plane_for_layer(&self, layer: usize) -> Option<PlaneRef> {
        self.zc_layers
            .iter()
            .find(|zl| zl.zl_layer == layer)
            .and_then(|zl| zl.zl_plane)
    }

    /// Every plane referenced by this config
    pub fn planes(&self) -> Vec<PlaneRef> {
        self.zc_layers.iter().filter_map(|zl| zl.zl_plane).collect()
    }
}

/// All planes of one class
struct PlanePool {
    pp_planes: Vec<DisplayPlane>,
    /// Bit set for every free plane
    pp_free: u32,
    /// Bit set for every plane waiting to be turned off
    pp_reclaimed: u32,
}

impl PlanePool {
    fn new(ty: PlaneType, count: usize) -> Self {
        Self {
            pp_planes: (0..count)
                .map(|i| DisplayPlane::new(PlaneRef::new(ty, i)))
                .collect(),
            pp_free: Self::mask(count),
            pp_reclaimed: 0,
        }
    }

    fn mask(count: usize) -> u32 {
        u32::MAX.checked_shr((32 - count) as u32).unwrap_or(0)
    }

    fn all(&self) -> u32 {
        Self::mask(self.pp_planes.len())
    }

    fn in_use(&self) -> u32 {
        self.all() & !self.pp_free & !self.pp_reclaimed
    }
}

/// Hands out planes to displays
///
/// Only the client thread touches this, from prepare and commit.
pub struct PlaneAllocator {
    pa_pools: [PlanePool; PlaneType::COUNT],
    pa_max_per_display: usize,
    /// Frames retired so far
    pa_flips: u64,
}

fn bit(index: usize) -> u32 {
    1 << index
}

impl PlaneAllocator {
    pub fn new(inventory: &PlaneInventory) -> Result<Self> {
        let count = |ty: PlaneType| match ty {
            PlaneType::Sprite => inventory.sprite,
            PlaneType::Overlay => inventory.overlay,
            PlaneType::Primary => inventory.primary,
            PlaneType::Cursor => inventory.cursor,
        };

        for ty in PlaneType::ALL.iter() {
            if count(*ty) > MAX_PLANES_PER_TYPE {
                log::error!("Too many {} planes: {}", ty.name(), count(*ty));
                return Err(HwcError::INVALID_CONFIG);
            }
        }
        if inventory.max_per_display == 0 {
            return Err(HwcError::INVALID_CONFIG);
        }

        log::debug!(
            "Plane inventory: {} primary, {} sprite, {} overlay, {} cursor",
            inventory.primary,
            inventory.sprite,
            inventory.overlay,
            inventory.cursor
        );

        Ok(Self {
            pa_pools: PlaneType::ALL.map(|ty| PlanePool::new(ty, count(ty))),
            pa_max_per_display: inventory.max_per_display,
            pa_flips: 0,
        })
    }

    fn pool(&self, ty: PlaneType) -> &PlanePool {
        &self.pa_pools[ty.index()]
    }

    fn pool_mut(&mut self, ty: PlaneType) -> &mut PlanePool {
        &mut self.pa_pools[ty.index()]
    }

    fn exists(&self, plane: PlaneRef) -> bool {
        plane.pr_index < self.pool(plane.pr_type).pp_planes.len()
    }

    pub fn plane_count(&self, ty: PlaneType) -> usize {
        self.pool(ty).pp_planes.len()
    }

    pub fn max_per_display(&self) -> usize {
        self.pa_max_per_display
    }

    /// Number of frames retired so far
    pub fn flips(&self) -> u64 {
        self.pa_flips
    }

    pub fn plane(&self, plane: PlaneRef) -> Option<&DisplayPlane> {
        self.pool(plane.pr_type).pp_planes.get(plane.pr_index)
    }

    pub fn plane_mut(&mut self, plane: PlaneRef) -> Option<&mut DisplayPlane> {
        self.pool_mut(plane.pr_type)
            .pp_planes
            .get_mut(plane.pr_index)
    }

    pub fn is_free(&self, plane: PlaneRef) -> bool {
        self.exists(plane) && self.pool(plane.pr_type).pp_free & bit(plane.pr_index) != 0
    }

    pub fn is_reclaimed(&self, plane: PlaneRef) -> bool {
        self.exists(plane) && self.pool(plane.pr_type).pp_reclaimed & bit(plane.pr_index) != 0
    }

    pub fn is_in_use(&self, plane: PlaneRef) -> bool {
        self.exists(plane) && self.pool(plane.pr_type).in_use() & bit(plane.pr_index) != 0
    }

    /// Planes of `ty` a display could acquire right now
    pub fn free_count(&self, display: usize, ty: PlaneType) -> usize {
        match ty.is_display_bound() {
            true => self.is_free(PlaneRef::new(ty, display)) as usize,
            false => self.pool(ty).pp_free.count_ones() as usize,
        }
    }

    /// Take the lowest numbered free plane of a class
    pub fn acquire(&mut self, ty: PlaneType) -> Option<PlaneRef> {
        let free = self.pool(ty).pp_free;
        if free == 0 {
            return None;
        }

        let index = free.trailing_zeros() as usize;
        self.pool_mut(ty).pp_free &= !bit(index);
        Some(PlaneRef::new(ty, index))
    }

    /// Take a plane for a display
    ///
    /// Display bound classes only hand out the plane wired to that display.
    pub fn acquire_for(&mut self, display: usize, ty: PlaneType) -> Option<PlaneRef> {
        let plane = match ty.is_display_bound() {
            true => {
                let plane = PlaneRef::new(ty, display);
                if !self.acquire_at(plane) {
                    return None;
                }
                plane
            }
            false => self.acquire(ty)?,
        };

        if let Some(p) = self.plane_mut(plane) {
            p.assign_to_device(display);
        }
        Some(plane)
    }

    /// Take one specific plane if it is free
    pub fn acquire_at(&mut self, plane: PlaneRef) -> bool {
        if !self.is_free(plane) {
            return false;
        }
        self.pool_mut(plane.pr_type).pp_free &= !bit(plane.pr_index);
        true
    }

    /// Give a plane back
    ///
    /// A plane that has been scanning out has to be turned off before
    /// anyone else may use it, so it is parked as reclaimed. One that
    /// never showed anything goes straight back to the free pool.
    pub fn release(&mut self, plane: PlaneRef, bm: &BufferManager) {
        if !self.is_in_use(plane) {
            log::error!("Releasing {} which is not in use", plane);
            return;
        }

        let displaying = self
            .plane(plane)
            .map(|p| p.is_displaying())
            .unwrap_or(false);
        let pool = self.pool_mut(plane.pr_type);
        match displaying {
            true => {
                log::debug!("Reclaiming {}", plane);
                pool.pp_reclaimed |= bit(plane.pr_index);
            }
            false => {
                pool.pp_planes[plane.pr_index].reset(bm);
                pool.pp_free |= bit(plane.pr_index);
            }
        }
    }

    /// Release every plane a display is using
    pub fn reclaim(&mut self, display: usize, bm: &BufferManager) {
        for plane in self.planes_of(display) {
            self.release(plane, bm);
        }
    }

    /// In use planes attached to a display
    pub fn planes_of(&self, display: usize) -> Vec<PlaneRef> {
        let mut ret = Vec::new();
        for pool in self.pa_pools.iter() {
            let in_use = pool.in_use();
            for (i, p) in pool.pp_planes.iter().enumerate() {
                if in_use & bit(i) != 0 && p.device() == Some(display) {
                    ret.push(p.get_ref());
                }
            }
        }
        ret
    }

    /// Planes of a display that should be turned off with its next flip
    ///
    /// That is reclaimed planes not yet disabled, plus in use planes
    /// missing from the displayed stack.
    pub fn pending_disables(&self, display: usize, active: &[PlaneRef]) -> Vec<PlaneRef> {
        let mut ret = Vec::new();
        for pool in self.pa_pools.iter() {
            let in_use = pool.in_use();
            for (i, p) in pool.pp_planes.iter().enumerate() {
                if p.device() != Some(display) {
                    continue;
                }
                let reclaimed = pool.pp_reclaimed & bit(i) != 0 && p.is_disable_pending();
                let idle = in_use & bit(i) != 0 && !active.contains(&p.get_ref());
                if reclaimed || idle {
                    ret.push(p.get_ref());
                }
            }
        }
        ret
    }

    /// Mark the end of a frame
    ///
    /// Reclaimed planes were turned off by the flips of this frame.
    pub fn retire_frame(&mut self) {
        let flips = self.pa_flips;
        for pool in self.pa_pools.iter_mut() {
            let reclaimed = pool.pp_reclaimed;
            for (i, p) in pool.pp_planes.iter_mut().enumerate() {
                if reclaimed & bit(i) != 0 {
                    p.disable(flips);
                }
            }
        }
        self.pa_flips += 1;
    }

    /// Return reclaimed planes the hardware is done with to the free pool
    ///
    /// Called once per frame before any new acquisitions.
    pub fn disable_reclaimed_planes(&mut self, bm: &BufferManager) {
        let flips = self.pa_flips;
        for pool in self.pa_pools.iter_mut() {
            for (i, p) in pool.pp_planes.iter_mut().enumerate() {
                if pool.pp_reclaimed & bit(i) != 0 && p.is_disabled(flips) {
                    log::debug!("{} is off, returning it", p.get_ref());
                    p.reset(bm);
                    pool.pp_reclaimed &= !bit(i);
                    pool.pp_free |= bit(i);
                }
            }
        }
    }

    /// Can this stack be shown on `display` with the planes available
    pub fn is_valid_zorder(&self, display: usize, config: &ZOrderConfig) -> bool {
        if config.is_empty() || config.len() > self.pa_max_per_display {
            log::trace!("zorder: {} planes is out of range", config.len());
            return false;
        }

        let mut last: Option<usize> = None;
        for zl in config.iter() {
            if let Some(prev) = last {
                if zl.zl_zorder <= prev {
                    log::trace!("zorder: slots not increasing");
                    return false;
                }
            }
            last = Some(zl.zl_zorder);
        }

        match config.count(PlaneType::Primary) {
            0 => {}
            1 => {
                let primary = PlaneRef::new(PlaneType::Primary, display);
                let owned = self.is_in_use(primary)
                    && self.plane(primary).and_then(|p| p.device()) == Some(display);
                if !owned {
                    log::trace!("zorder: display {} does not own its primary", display);
                    return false;
                }
            }
            _ => return false,
        }

        if config.count(PlaneType::Cursor) > 0 {
            let top = config.iter().last().map(|zl| zl.zl_type);
            if config.count(PlaneType::Cursor) > 1 || top != Some(PlaneType::Cursor) {
                log::trace!("zorder: cursor not on top");
                return false;
            }
        }

        for ty in [PlaneType::Sprite, PlaneType::Overlay, PlaneType::Cursor] {
            if config.count(ty) > self.free_count(display, ty) {
                log::trace!("zorder: not enough {} planes", ty.name());
                return false;
            }
        }

        true
    }

    /// Acquire a plane for every entry of `config`
    ///
    /// Either every entry gets a plane or none does.
    pub fn assign_planes(
        &mut self,
        display: usize,
        config: &mut ZOrderConfig,
        bm: &BufferManager,
    ) -> bool {
        let mut acquired = Vec::new();
        let mut ok = true;

        for zl in config.iter_mut() {
            let plane = match zl.zl_type {
                PlaneType::Primary => Some(PlaneRef::new(PlaneType::Primary, display)),
                ty => self.acquire_for(display, ty),
            };
            match plane {
                Some(p) => {
                    if zl.zl_type != PlaneType::Primary {
                        acquired.push(p);
                    }
                    zl.zl_plane = Some(p);
                }
                None => {
                    ok = false;
                    break;
                }
            }
        }

        if !ok {
            log::trace!("Could not acquire planes, rolling back");
            for p in acquired {
                self.release(p, bm);
            }
            for zl in config.iter_mut() {
                zl.zl_plane = None;
            }
            return false;
        }

        for zl in config.iter() {
            if let Some(p) = zl.zl_plane.and_then(|r| self.plane_mut(r)) {
                p.assign_to_device(display);
                p.set_zorder(zl.zl_zorder);
            }
        }
        true
    }

    pub fn dump(&self, d: &mut String) {
        let _ = writeln!(d, "Planes (frame {}):", self.pa_flips);
        let _ = writeln!(d, "  plane     | state     | display | zorder | buffer");
        let _ = writeln!(d, "  ----------+-----------+---------+--------+-----------");
        for pool in self.pa_pools.iter() {
            let in_use = pool.in_use();
            for (i, p) in pool.pp_planes.iter().enumerate() {
                let state = if in_use & bit(i) != 0 {
                    "in use"
                } else if pool.pp_reclaimed & bit(i) != 0 {
                    "reclaimed"
                } else {
                    "free"
                };
                let display = match p.device() {
                    Some(d) => d.to_string(),
                    None => "-".to_string(),
                };
                let buffer = match p.current_buffer() {
                    Some(h) => format!("{:#x}", h),
                    None => "-".to_string(),
                };
                let _ = writeln!(
                    d,
                    "  {:10}| {:10}| {:8}| {:7}| {}",
                    p.get_ref().to_string(),
                    state,
                    display,
                    p.zorder(),
                    buffer
                );
            }
        }
    }

    /// Return every plane to the free pool, dropping its buffers
    pub fn deinitialize(&mut self, bm: &BufferManager) {
        for pool in self.pa_pools.iter_mut() {
            for p in pool.pp_planes.iter_mut() {
                p.reset(bm);
            }
            pool.pp_free = pool.all();
            pool.pp_reclaimed = 0;
        }
    }
}
