// Layer to plane assignment
//
// For every display list we decide which layers the display planes can
// scan out directly. Everything else is drawn by the GPU into the
// framebuffer target, which then needs a plane of its own.
//
// Candidates for each plane class are collected first and sorted by
// priority. The search then tries to give as many candidates as
// possible a plane, class by class (cursor, overlay, sprite), falling
// back to fewer planes whenever the resulting stack can't be shown.
pub mod capabilities;

use crate::buffer::BufferManager;
use crate::layer::{
    Assignment, BufferHandle, CompositionHint, CompositionType, ContentsFlags, DisplayContents,
    Layer, PixelFormat,
};
use crate::plane::manager::{PlaneAllocator, ZOrderConfig};
use crate::plane::{PlaneRef, PlaneType};
use crate::{CapabilityLimits, HwcError, Result};
use capabilities::PlaneCapabilities;
use utils::log;

use std::cmp::Ordering;
use std::fmt::Write;

/// Added to the score of protected layers
pub const PRIORITY_PROTECTED: u32 = 0x7000_0000;
/// Added to the score of layers in a format the overlay can show
pub const PRIORITY_OVERLAY: u32 = 0x6000_0000;
const PRIORITY_SIZE_OFFSET: u32 = 4;

/// The order plane classes are handed out in
const SEARCH_ORDER: [PlaneType; 3] = [PlaneType::Cursor, PlaneType::Overlay, PlaneType::Sprite];

/// How much a layer wants a plane
///
/// Larger source crops score higher, the layer index is folded into the
/// low bits, and protected or overlay friendly content is boosted above
/// everything else. This ordering is relied on by clients and must not
/// change.
pub fn priority_score(layer: &Layer, index: usize) -> u32 {
    let area = (layer.l_crop.width() * layer.l_crop.height()) as u32;
    let mut score = area.wrapping_shl(PRIORITY_SIZE_OFFSET) | index as u32;

    if layer.is_protected() {
        score |= PRIORITY_PROTECTED;
    } else if PlaneCapabilities::is_format_supported(PlaneType::Overlay, layer) {
        score |= PRIORITY_OVERLAY;
    }
    score
}

/// Outcome of a plane assignment pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignResult {
    /// A valid plane stack was found, some layers may still be on the GPU
    Success,
    /// No valid stack exists, the whole frame is drawn by the GPU
    Fallback,
}

/// Per layer bookkeeping for the search
#[derive(Debug, Clone)]
struct LayerState {
    ls_index: usize,
    /// Stacking slot, the index shifted up to leave 0 for the target
    ls_zorder: usize,
    ls_priority: u32,
    ls_handle: BufferHandle,
    ls_format: PixelFormat,
    /// Part of the stack currently being tried
    ls_candidate: bool,
    /// Could be shown by the primary plane on its own
    ls_primary_ok: bool,
    ls_assignment: Assignment,
}

/// Borrowed state the search needs
struct SearchCtx<'a> {
    sc_layers: &'a [Layer],
    sc_planes: &'a mut PlaneAllocator,
    sc_bm: &'a BufferManager,
}

/// Decides plane usage for one display
pub struct LayerCompositor {
    lc_display: usize,
    lc_caps: PlaneCapabilities,
    lc_layers: Vec<LayerState>,
    /// Layers drawn by the GPU unless they get a plane, in list order
    lc_fb: Vec<usize>,
    lc_target: Option<usize>,
    lc_cursor: Vec<usize>,
    lc_overlay: Vec<usize>,
    lc_sprite: Vec<usize>,
    /// The stack under construction
    lc_zorder: ZOrderConfig,
    /// The stack found by the last successful search
    lc_assigned: ZOrderConfig,
    /// The display's pinned primary plane
    lc_primary: Option<PlaneRef>,
    lc_layer_count: usize,
    /// lc_assigned matches the current geometry
    lc_valid: bool,
    /// Layers whose buffer could not be mapped, kept off planes this frame
    lc_excluded: Vec<usize>,
    /// Mapping kept failing, draw everything on the GPU this frame
    lc_frame_fallback: bool,
}

impl LayerCompositor {
    pub fn new(display: usize, limits: CapabilityLimits) -> Self {
        Self {
            lc_display: display,
            lc_caps: PlaneCapabilities::new(limits),
            lc_layers: Vec::new(),
            lc_fb: Vec::new(),
            lc_target: None,
            lc_cursor: Vec::new(),
            lc_overlay: Vec::new(),
            lc_sprite: Vec::new(),
            lc_zorder: ZOrderConfig::new(),
            lc_assigned: ZOrderConfig::new(),
            lc_primary: None,
            lc_layer_count: 0,
            lc_valid: false,
            lc_excluded: Vec::new(),
            lc_frame_fallback: false,
        }
    }

    pub fn capabilities(&self) -> &PlaneCapabilities {
        &self.lc_caps
    }

    pub fn layer_count(&self) -> usize {
        self.lc_layer_count
    }

    /// Layers kept on the GPU this frame because their buffer could not
    /// be mapped
    pub fn excluded_layers(&self) -> &[usize] {
        &self.lc_excluded
    }

    /// Is the current frame drawn by the GPU because of mapping failures
    pub fn is_frame_fallback(&self) -> bool {
        self.lc_frame_fallback
    }

    /// Assign planes for a frame, reusing the last stack when the
    /// geometry did not change, and bind this frame's buffers
    ///
    /// A layer whose buffer can not be mapped is moved to the GPU and the
    /// remaining layers are assigned again. The full stack is retried on
    /// the next frame.
    pub fn prepare(
        &mut self,
        contents: &mut DisplayContents,
        planes: &mut PlaneAllocator,
        bm: &BufferManager,
        primary: Option<PlaneRef>,
    ) -> AssignResult {
        let rebuild = !self.lc_valid
            || !self.lc_excluded.is_empty()
            || contents.dc_flags.contains(ContentsFlags::GEOMETRY_CHANGED)
            || contents.dc_layers.len() != self.lc_layer_count
            || self.lc_primary != primary;
        self.lc_excluded.clear();

        let mut result = match rebuild {
            true => self.assign_planes(&mut contents.dc_layers, planes, bm, primary),
            false => AssignResult::Success,
        };

        if result == AssignResult::Success {
            let mut failed = self.update(&contents.dc_layers, planes, bm);
            while !failed.is_empty() && self.lc_excluded.len() < contents.dc_layers.len() {
                log::info!(
                    "Display {}: layers {:?} go to the GPU for this frame",
                    self.lc_display,
                    failed
                );
                self.lc_excluded.append(&mut failed);
                result = self.assign_planes(&mut contents.dc_layers, planes, bm, primary);
                if result != AssignResult::Success {
                    break;
                }
                failed = self.update(&contents.dc_layers, planes, bm);
            }
        }
        self.write_assignments(&mut contents.dc_layers);
        result
    }

    /// Run the full search for a new layer list
    ///
    /// Planes held from the previous geometry are released first. Every
    /// layer's `Assignment` is written before returning.
    pub fn assign_planes(
        &mut self,
        layers: &mut [Layer],
        planes: &mut PlaneAllocator,
        bm: &BufferManager,
        primary: Option<PlaneRef>,
    ) -> AssignResult {
        self.release_planes(planes, bm);
        self.lc_primary = primary;
        self.lc_layer_count = layers.len();
        self.classify(layers);

        let found = {
            let mut ctx = SearchCtx {
                sc_layers: &*layers,
                sc_planes: planes,
                sc_bm: bm,
            };
            self.allocate_planes(&mut ctx)
        };
        self.lc_zorder.clear();
        for state in self.lc_layers.iter_mut() {
            state.ls_candidate = false;
        }

        let result = match found {
            true => {
                self.lc_valid = true;
                AssignResult::Success
            }
            false => {
                log::debug!(
                    "Display {}: no valid plane stack, composing on the GPU",
                    self.lc_display
                );
                self.lc_assigned.clear();
                AssignResult::Fallback
            }
        };
        self.write_assignments(layers);
        result
    }

    fn candidates(&self, ty: PlaneType) -> &[usize] {
        match ty {
            PlaneType::Cursor => &self.lc_cursor,
            PlaneType::Overlay => &self.lc_overlay,
            _ => &self.lc_sprite,
        }
    }

    fn sort_by_priority(&self, list: &mut Vec<usize>) {
        let states = &self.lc_layers;
        list.sort_by(|a, b| match states[*b].ls_priority.cmp(&states[*a].ls_priority) {
            Ordering::Equal => a.cmp(b),
            ord => ord,
        });
    }

    /// Sort the layers into the candidate lists of each plane class
    fn classify(&mut self, layers: &[Layer]) {
        self.lc_layers.clear();
        self.lc_fb.clear();
        self.lc_cursor.clear();
        self.lc_overlay.clear();
        self.lc_sprite.clear();
        self.lc_zorder.clear();

        self.lc_target = layers
            .iter()
            .rposition(|l| l.l_hint == CompositionHint::FramebufferTarget);
        let count = self.lc_target.unwrap_or(layers.len());
        let mut rgb_overlay = Vec::new();

        for (i, layer) in layers.iter().enumerate() {
            let mut state = LayerState {
                ls_index: i,
                ls_zorder: i + 1,
                ls_priority: priority_score(layer, i),
                ls_handle: layer.l_handle,
                ls_format: layer.l_format,
                ls_candidate: false,
                ls_primary_ok: false,
                ls_assignment: Assignment::gpu(),
            };

            match layer.l_hint {
                CompositionHint::FramebufferTarget | CompositionHint::Sideband => {}
                CompositionHint::ForceClient => self.lc_fb.push(i),
                CompositionHint::Device if self.lc_excluded.contains(&i) => self.lc_fb.push(i),
                CompositionHint::Device => {
                    self.lc_fb.push(i);
                    state.ls_primary_ok = self.lc_caps.check(PlaneType::Primary, layer).is_ok();

                    if self.lc_caps.check_cursor(layer, i, count).is_ok() {
                        self.lc_cursor.push(i);
                    } else if self.lc_caps.check_rgb_overlay(layer).is_ok() {
                        rgb_overlay.push(i);
                    } else {
                        match (
                            self.lc_caps.check(PlaneType::Sprite, layer),
                            self.lc_caps.check(PlaneType::Overlay, layer),
                        ) {
                            (Ok(()), _) => self.lc_sprite.push(i),
                            (_, Ok(())) => self.lc_overlay.push(i),
                            (Err(sprite), Err(overlay)) => log::trace!(
                                "layer {}: stays on the GPU (sprite: {}, overlay: {})",
                                i,
                                sprite,
                                overlay
                            ),
                        }
                    }
                }
            }
            self.lc_layers.push(state);
        }

        // opaque RGB layers may use an overlay, unless video needs them
        match self.lc_overlay.is_empty() {
            true => self.lc_overlay.append(&mut rgb_overlay),
            false => self.lc_sprite.append(&mut rgb_overlay),
        }

        let mut lists = [
            std::mem::take(&mut self.lc_cursor),
            std::mem::take(&mut self.lc_overlay),
            std::mem::take(&mut self.lc_sprite),
        ];
        for list in lists.iter_mut() {
            self.sort_by_priority(list);
        }
        let [cursor, overlay, sprite] = lists;
        self.lc_cursor = cursor;
        self.lc_overlay = overlay;
        self.lc_sprite = sprite;

        log::trace!(
            "Display {}: {} layers, candidates: {} cursor, {} overlay, {} sprite",
            self.lc_display,
            layers.len(),
            self.lc_cursor.len(),
            self.lc_overlay.len(),
            self.lc_sprite.len()
        );
    }

    fn allocate_planes(&mut self, ctx: &mut SearchCtx) -> bool {
        let target = match self.lc_target {
            Some(t) => t,
            None => {
                log::error!("Display {}: no framebuffer target", self.lc_display);
                return false;
            }
        };

        if self.lc_fb.is_empty() {
            return self.assign_primary_helper(ctx, target, 0);
        }

        // one layer the primary can show needs no GPU pass at all
        if self.lc_fb.len() == 1 {
            let only = self.lc_fb[0];
            let zorder = self.lc_layers[only].ls_zorder;
            if self.lc_layers[only].ls_primary_ok && self.assign_primary_helper(ctx, only, zorder)
            {
                return true;
            }
        }

        self.assign_stage(ctx, 0)
    }

    /// Give as many candidates of one class as possible a plane, then
    /// move on to the next class
    fn assign_stage(&mut self, ctx: &mut SearchCtx, stage: usize) -> bool {
        if stage == SEARCH_ORDER.len() {
            return self.assign_primary_plane(ctx);
        }

        let ty = SEARCH_ORDER[stage];
        let candidates = self.candidates(ty).len();
        if candidates == 0 {
            return self.assign_stage(ctx, stage + 1);
        }

        let free = ctx.sc_planes.free_count(self.lc_display, ty);
        if free == 0 {
            log::trace!("no {} plane available, {} candidates", ty.name(), candidates);
            return self.assign_stage(ctx, stage + 1);
        }

        for n in (0..=free.min(candidates)).rev() {
            if self.assign_class(ctx, stage, 0, n) {
                return true;
            }
        }
        false
    }

    /// Try every combination of `remaining` candidates starting at `start`
    fn assign_class(
        &mut self,
        ctx: &mut SearchCtx,
        stage: usize,
        start: usize,
        remaining: usize,
    ) -> bool {
        if remaining == 0 {
            return self.assign_stage(ctx, stage + 1);
        }

        let ty = SEARCH_ORDER[stage];
        let count = self.candidates(ty).len();
        for i in start..=(count - remaining) {
            let layer = self.candidates(ty)[i];
            let zorder = self.lc_layers[layer].ls_zorder;
            self.add_zorder_layer(ty, layer, zorder);
            if self.assign_class(ctx, stage, i + 1, remaining - 1) {
                return true;
            }
            self.remove_zorder_layer(layer);
        }
        false
    }

    /// Find a place for the framebuffer target in the stack
    fn assign_primary_plane(&mut self, ctx: &mut SearchCtx) -> bool {
        let target = match self.lc_target {
            Some(t) => t,
            None => return false,
        };

        // the lowest priority sprite candidates left without a plane
        let mut sprite_layer = None;
        for &i in self.lc_sprite.iter().rev() {
            if self.lc_layers[i].ls_candidate {
                break;
            }
            sprite_layer = Some(i);
        }

        let candidates = self.lc_zorder.len();
        let layers = self.lc_fb.len();

        if let (true, Some(layer)) = (candidates + 1 == layers, sprite_layer) {
            // the primary plane acts as one more sprite
            let zorder = self.lc_layers[layer].ls_zorder;
            if self.assign_primary_helper(ctx, layer, zorder) {
                return true;
            }
            log::trace!("failed to use primary as sprite plane");
            false
        } else if candidates == 0 {
            self.assign_primary_helper(ctx, target, 0)
        } else if candidates == layers {
            self.attach_planes(ctx)
        } else {
            for pos in 0..layers {
                let layer = self.lc_fb[pos];
                if self.lc_layers[layer].ls_candidate || !self.use_as_target(ctx.sc_layers, pos) {
                    continue;
                }
                let zorder = self.lc_layers[layer].ls_zorder;
                if self.assign_primary_helper(ctx, target, zorder) {
                    return true;
                }
                log::trace!("failed to use zorder {} for the framebuffer target", zorder);
            }
            log::trace!("no possible zorder for the framebuffer target");
            false
        }
    }

    /// Can the target take the slot of the GPU layer at `target_pos`
    ///
    /// Every GPU layer gets drawn into the target, so it effectively moves
    /// to the target's slot. That is only allowed if it does not pass
    /// through a plane layer it overlaps on the way.
    fn use_as_target(&self, layers: &[Layer], target_pos: usize) -> bool {
        let fb = &self.lc_fb;
        let is_candidate = |pos: usize| self.lc_layers[fb[pos]].ls_candidate;
        let overlaps = |a: usize, b: usize| layers[fb[a]].l_frame.overlaps(&layers[fb[b]].l_frame);

        for below in 0..target_pos {
            if is_candidate(below) {
                continue;
            }
            for above in (below + 1)..target_pos {
                if is_candidate(above) && overlaps(above, below) {
                    return false;
                }
            }
        }

        for above in (target_pos + 1)..fb.len() {
            if is_candidate(above) {
                continue;
            }
            for below in (target_pos + 1)..above {
                if is_candidate(below) && overlaps(above, below) {
                    return false;
                }
            }
        }

        true
    }

    fn assign_primary_helper(&mut self, ctx: &mut SearchCtx, layer: usize, zorder: usize) -> bool {
        if self.lc_primary.is_none() {
            return false;
        }

        self.add_zorder_layer(PlaneType::Primary, layer, zorder);
        let ok = self.attach_planes(ctx);
        if !ok {
            self.remove_zorder_layer(layer);
        }
        ok
    }

    /// Validate the stack under construction and acquire its planes
    fn attach_planes(&mut self, ctx: &mut SearchCtx) -> bool {
        if !ctx.sc_planes.is_valid_zorder(self.lc_display, &self.lc_zorder) {
            log::trace!("invalid z order, {} planes", self.lc_zorder.len());
            return false;
        }
        if !ctx
            .sc_planes
            .assign_planes(self.lc_display, &mut self.lc_zorder, ctx.sc_bm)
        {
            log::trace!("failed to assign planes");
            return false;
        }

        for zl in self.lc_zorder.iter() {
            log::trace!(
                "layer {} => {} at zorder {}",
                zl.zl_layer,
                zl.zl_plane.map(|p| p.to_string()).unwrap_or_default(),
                zl.zl_zorder
            );
        }
        self.lc_assigned = self.lc_zorder.clone();
        true
    }

    fn add_zorder_layer(&mut self, ty: PlaneType, layer: usize, zorder: usize) {
        self.lc_layers[layer].ls_candidate = true;
        self.lc_zorder.add(ty, zorder, layer);
    }

    fn remove_zorder_layer(&mut self, layer: usize) {
        self.lc_zorder.remove_layer(layer);
        self.lc_layers[layer].ls_candidate = false;
    }

    /// Push this frame's layer attributes and buffers to the planes
    ///
    /// Returns the layers whose buffer could not be mapped. Until they
    /// are assigned again the frame is drawn by the GPU.
    pub fn update(
        &mut self,
        layers: &[Layer],
        planes: &mut PlaneAllocator,
        bm: &BufferManager,
    ) -> Vec<usize> {
        let mut failed = Vec::new();

        for zl in self.lc_assigned.iter() {
            if Some(zl.zl_layer) == self.lc_target {
                continue;
            }
            let (layer, plane) = match (
                layers.get(zl.zl_layer),
                zl.zl_plane.and_then(|p| planes.plane_mut(p)),
            ) {
                (Some(l), Some(p)) => (l, p),
                _ => {
                    failed.push(zl.zl_layer);
                    continue;
                }
            };

            plane.set_position(layer.l_frame);
            plane.set_source_crop(layer.l_crop);
            plane.set_transform(layer.l_transform);
            plane.set_plane_alpha(layer.l_plane_alpha);
            if let Err(e) = plane.set_data_buffer(layer.l_handle, bm) {
                log::error!(
                    "Display {}: layer {} can not use {}: {}",
                    self.lc_display,
                    zl.zl_layer,
                    plane.get_ref(),
                    e
                );
                failed.push(zl.zl_layer);
            }
        }

        self.lc_frame_fallback = !failed.is_empty();
        failed
    }

    /// Bind the framebuffer target to its plane, if it has one
    pub fn bind_target(
        &self,
        layers: &[Layer],
        planes: &mut PlaneAllocator,
        bm: &BufferManager,
    ) -> Result<()> {
        let target = match self.lc_target {
            Some(t) => t,
            None => return Ok(()),
        };
        let config = self.active_zorder();
        let entry = match config.iter().find(|zl| zl.zl_layer == target) {
            Some(e) => *e,
            None => return Ok(()),
        };

        let layer = layers.get(target).ok_or(HwcError::INVALID_HANDLE)?;
        let plane = entry
            .zl_plane
            .and_then(|p| planes.plane_mut(p))
            .ok_or(HwcError::HARDWARE_FAILURE)?;
        plane.set_zorder(entry.zl_zorder);
        plane.set_position(layer.l_frame);
        plane.set_source_crop(layer.l_crop);
        plane.set_transform(layer.l_transform);
        plane.set_plane_alpha(layer.l_plane_alpha);
        plane.set_data_buffer(layer.l_handle, bm)
    }

    /// The plane stack to flip this frame
    pub fn active_zorder(&self) -> ZOrderConfig {
        if !self.lc_frame_fallback {
            return self.lc_assigned.clone();
        }

        let mut config = ZOrderConfig::new();
        if let (Some(target), Some(primary)) = (self.lc_target, self.lc_primary) {
            config.add(PlaneType::Primary, 0, target);
            if let Some(zl) = config.iter_mut().next() {
                zl.zl_plane = Some(primary);
            }
        }
        config
    }

    /// Record the outcome in every layer
    fn write_assignments(&mut self, layers: &mut [Layer]) {
        let config = self.active_zorder();

        for (i, layer) in layers.iter_mut().enumerate() {
            let entry = config.iter().find(|zl| zl.zl_layer == i);
            layer.l_assignment = match layer.l_hint {
                CompositionHint::FramebufferTarget => Assignment {
                    a_type: CompositionType::FramebufferTarget,
                    a_plane: entry.and_then(|zl| zl.zl_plane),
                },
                CompositionHint::Sideband => Assignment {
                    a_type: CompositionType::Sideband,
                    a_plane: None,
                },
                _ => match entry.and_then(|zl| zl.zl_plane) {
                    Some(p) => Assignment {
                        a_type: match p.pr_type {
                            PlaneType::Cursor => CompositionType::CursorOverlay,
                            _ => CompositionType::Overlay,
                        },
                        a_plane: Some(p),
                    },
                    None => Assignment::gpu(),
                },
            };

            if let Some(state) = self.lc_layers.get_mut(i) {
                state.ls_handle = layer.l_handle;
                state.ls_assignment = layer.l_assignment;
            }
        }
    }

    /// Give back every plane this display acquired
    ///
    /// The pinned primary plane belongs to the display and is left alone.
    pub fn release_planes(&mut self, planes: &mut PlaneAllocator, bm: &BufferManager) {
        for p in self.lc_assigned.planes() {
            if p.pr_type != PlaneType::Primary {
                planes.release(p, bm);
            }
        }
        self.lc_assigned.clear();
        self.lc_valid = false;
        self.lc_frame_fallback = false;
    }

    /// Draw the whole frame on the GPU
    ///
    /// With a `primary` plane the framebuffer target is shown on it,
    /// otherwise nothing is scanned out at all.
    pub fn compose_on_gpu(
        &mut self,
        layers: &mut [Layer],
        planes: &mut PlaneAllocator,
        bm: &BufferManager,
        primary: Option<PlaneRef>,
    ) {
        self.release_planes(planes, bm);
        self.lc_primary = primary;
        self.lc_layer_count = layers.len();
        self.classify(layers);

        if let (Some(target), Some(p)) = (self.lc_target, primary) {
            self.lc_assigned.add(PlaneType::Primary, 0, target);
            if let Some(zl) = self.lc_assigned.iter_mut().next() {
                zl.zl_plane = Some(p);
            }
        }
        self.write_assignments(layers);
    }

    pub fn dump(&self, d: &mut String) {
        let _ = writeln!(
            d,
            "Display {} layers: {}{}",
            self.lc_display,
            self.lc_layers.len(),
            match self.lc_frame_fallback {
                true => " (GPU fallback)",
                false => "",
            }
        );
        let _ = writeln!(d, "  layer | type                | plane     | format    | handle");
        let _ = writeln!(d, "  ------+---------------------+-----------+-----------+---------");
        for state in self.lc_layers.iter() {
            let plane = state
                .ls_assignment
                .a_plane
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                d,
                "  {:5} | {:20}| {:10}| {:10}| {:#x}",
                state.ls_index,
                format!("{:?}", state.ls_assignment.a_type),
                plane,
                format!("{:?}", state.ls_format),
                state.ls_handle
            );
        }
    }
}

#[cfg(test)]
mod tests;
